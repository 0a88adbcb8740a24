//! Workflow context actor
//!
//! The shared variable namespace of one workflow instance. All mutation
//! flows through a single actor task, so concurrent step completions
//! serialize deterministically without locking the tree itself. Paths are
//! dot-separated (`steps.draft.output`); intermediate objects are created
//! on write.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

enum ContextCommand {
    Get {
        path: String,
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
    Set {
        path: String,
        value: serde_json::Value,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<serde_json::Value>,
    },
}

/// Handle to a workflow's context actor
#[derive(Clone)]
pub struct ContextHandle {
    tx: mpsc::Sender<ContextCommand>,
}

impl ContextHandle {
    /// Spawn the actor owning `initial`
    pub fn spawn(initial: serde_json::Value) -> Self {
        let (tx, mut rx) = mpsc::channel::<ContextCommand>(64);

        tokio::spawn(async move {
            let mut root = if initial.is_object() {
                initial
            } else {
                serde_json::Value::Object(serde_json::Map::new())
            };

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ContextCommand::Get { path, reply } => {
                        let _ = reply.send(get_path(&root, &path).cloned());
                    }
                    ContextCommand::Set { path, value, reply } => {
                        set_path(&mut root, &path, value);
                        let _ = reply.send(());
                    }
                    ContextCommand::Snapshot { reply } => {
                        let _ = reply.send(root.clone());
                    }
                }
            }
            debug!("context actor stopped");
        });

        Self { tx }
    }

    pub async fn get(&self, path: &str) -> Option<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ContextCommand::Get {
                path: path.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn set(&self, path: &str, value: serde_json::Value) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ContextCommand::Set {
                path: path.to_string(),
                value,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ContextCommand::Snapshot { reply }).await.is_err() {
            return serde_json::Value::Object(serde_json::Map::new());
        }
        rx.await.unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
    }
}

/// Resolve a dot-path inside a JSON tree
pub fn get_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write a dot-path, creating intermediate objects as needed
pub fn set_path(root: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(segment.to_string(), value);
            }
            return;
        }
        if !current.get(*segment).is_some_and(|v| v.is_object()) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(segment.to_string(), serde_json::Value::Object(serde_json::Map::new()));
            } else {
                return;
            }
        }
        current = current.get_mut(*segment).expect("segment just ensured");
    }
}

/// JSON truthiness for step conditions
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty() && s != "false",
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_nested() {
        let root = json!({"steps": {"draft": {"output": "text"}}});
        assert_eq!(get_path(&root, "steps.draft.output"), Some(&json!("text")));
        assert_eq!(get_path(&root, "steps.missing.output"), None);
        assert_eq!(get_path(&root, "steps"), Some(&json!({"draft": {"output": "text"}})));
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut root = json!({});
        set_path(&mut root, "a.b.c", json!(42));
        assert_eq!(root, json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn test_set_path_overwrites_scalar_intermediate() {
        let mut root = json!({"a": "scalar"});
        set_path(&mut root, "a.b", json!(1));
        assert_eq!(root, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_actor_get_set_snapshot() {
        let ctx = ContextHandle::spawn(json!({"topic": "drums"}));
        assert_eq!(ctx.get("topic").await, Some(json!("drums")));

        ctx.set("steps.a.output", json!("done")).await;
        assert_eq!(ctx.get("steps.a.output").await, Some(json!("done")));

        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot["topic"], "drums");
        assert_eq!(snapshot["steps"]["a"]["output"], "done");
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_disjoint_paths() {
        let ctx = ContextHandle::spawn(json!({}));
        let mut handles = Vec::new();
        for i in 0..32 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.set(&format!("steps.s{}.output", i), json!(i)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..32 {
            assert_eq!(ctx.get(&format!("steps.s{}.output", i)).await, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_non_object_initial_becomes_empty() {
        let ctx = ContextHandle::spawn(json!("not an object"));
        ctx.set("k", json!(1)).await;
        assert_eq!(ctx.get("k").await, Some(json!(1)));
    }
}
