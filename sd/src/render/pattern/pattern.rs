//! Pattern representation and the time-arc query
//!
//! A pattern is a small AST queried over an arc of cycle time. Queries
//! return haps: timed occurrences with a whole interval, the queried part
//! of it, and the event value. Only haps whose part begins at their whole
//! (`has_onset`) trigger sound.

use super::fraction::Fraction;
use super::value::{Control, EventValue};

/// Half-open interval `[begin, end)` in cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub begin: Fraction,
    pub end: Fraction,
}

impl Span {
    pub fn new(begin: Fraction, end: Fraction) -> Self {
        Self { begin, end }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn intersect(&self, other: &Span) -> Span {
        Span {
            begin: self.begin.max(other.begin),
            end: self.end.min(other.end),
        }
    }

    pub fn duration(&self) -> Fraction {
        self.end - self.begin
    }
}

/// A timed occurrence produced by a pattern query
#[derive(Debug, Clone, PartialEq)]
pub struct Hap {
    /// The event's full interval
    pub whole: Span,
    /// The portion that falls inside the queried arc
    pub part: Span,
    pub value: EventValue,
}

impl Hap {
    /// True when the queried part contains the event's start
    pub fn has_onset(&self) -> bool {
        self.part.begin == self.whole.begin
    }

    fn shifted(mut self, delta: Fraction) -> Self {
        self.whole.begin = self.whole.begin + delta;
        self.whole.end = self.whole.end + delta;
        self.part.begin = self.part.begin + delta;
        self.part.end = self.part.end + delta;
        self
    }

    fn scaled(mut self, factor: Fraction) -> Self {
        self.whole.begin = self.whole.begin * factor;
        self.whole.end = self.whole.end * factor;
        self.part.begin = self.part.begin * factor;
        self.part.end = self.part.end * factor;
        self
    }
}

/// Pattern AST
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Silence,
    /// One event filling each cycle
    Atom(EventValue),
    /// Subdivide each cycle equally among the children
    Sequence(Vec<Pattern>),
    /// One child per cycle, round-robin (`<a b>` alternation)
    Cat(Vec<Pattern>),
    /// All children at once
    Stack(Vec<Pattern>),
    /// Speed up by a factor
    Fast(Fraction, Box<Pattern>),
    /// Slow down by a factor
    Slow(Fraction, Box<Pattern>),
    /// Overlay a control onto every event of the inner pattern
    Control(Control, Box<Pattern>),
}

impl Pattern {
    /// All haps intersecting `[begin, end)`, sorted by part start
    pub fn query_arc(&self, begin: Fraction, end: Fraction) -> Vec<Hap> {
        let mut haps = self.query(&Span::new(begin, end));
        haps.sort_by(|a, b| {
            a.part
                .begin
                .cmp(&b.part.begin)
                .then_with(|| a.whole.begin.cmp(&b.whole.begin))
        });
        haps
    }

    fn query(&self, span: &Span) -> Vec<Hap> {
        if span.is_empty() {
            return Vec::new();
        }
        match self {
            Pattern::Silence => Vec::new(),
            Pattern::Atom(value) => query_atom(value, span),
            Pattern::Sequence(items) => {
                if items.is_empty() {
                    return Vec::new();
                }
                // A sequence is the alternation sped up to fit one cycle
                let factor = Fraction::from_int(items.len() as i64);
                query_fast(factor, |s| query_cat(items, s), span)
            }
            Pattern::Cat(items) => query_cat(items, span),
            Pattern::Stack(items) => items.iter().flat_map(|p| p.query(span)).collect(),
            Pattern::Fast(factor, inner) => query_fast(*factor, |s| inner.query(s), span),
            Pattern::Slow(factor, inner) => {
                if *factor <= Fraction::ZERO {
                    return Vec::new();
                }
                query_fast(factor.recip(), |s| inner.query(s), span)
            }
            Pattern::Control(control, inner) => {
                let mut haps = inner.query(span);
                for hap in &mut haps {
                    control.apply(&mut hap.value);
                }
                haps
            }
        }
    }
}

fn query_atom(value: &EventValue, span: &Span) -> Vec<Hap> {
    let mut out = Vec::new();
    for n in span.begin.floor()..span.end.ceil() {
        let whole = Span::new(Fraction::from_int(n), Fraction::from_int(n + 1));
        let part = whole.intersect(span);
        if !part.is_empty() {
            out.push(Hap {
                whole,
                part,
                value: value.clone(),
            });
        }
    }
    out
}

fn query_cat(items: &[Pattern], span: &Span) -> Vec<Hap> {
    if items.is_empty() {
        return Vec::new();
    }
    let k = items.len() as i64;
    let mut out = Vec::new();
    for n in span.begin.floor()..span.end.ceil() {
        let cycle = Span::new(Fraction::from_int(n), Fraction::from_int(n + 1));
        let clipped = cycle.intersect(span);
        if clipped.is_empty() {
            continue;
        }
        let index = n.rem_euclid(k) as usize;
        // Shift so the chosen child sees its own local cycle count
        let shift = Fraction::from_int(n - n.div_euclid(k));
        let local = Span::new(clipped.begin - shift, clipped.end - shift);
        for hap in items[index].query(&local) {
            out.push(hap.shifted(shift));
        }
    }
    out
}

fn query_fast<F>(factor: Fraction, inner: F, span: &Span) -> Vec<Hap>
where
    F: Fn(&Span) -> Vec<Hap>,
{
    if factor <= Fraction::ZERO {
        return Vec::new();
    }
    let stretched = Span::new(span.begin * factor, span.end * factor);
    inner(&stretched)
        .into_iter()
        .map(|hap| hap.scaled(factor.recip()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(name: &str) -> Pattern {
        Pattern::Atom(EventValue::sample(name, 0))
    }

    fn frac(num: i64, den: i64) -> Fraction {
        Fraction::new(num, den)
    }

    fn onsets(haps: &[Hap]) -> Vec<(Fraction, &str)> {
        haps.iter()
            .filter(|h| h.has_onset())
            .map(|h| (h.whole.begin, h.value.sample.as_deref().unwrap_or("~")))
            .collect()
    }

    #[test]
    fn test_atom_one_event_per_cycle() {
        let p = atom("bd");
        let haps = p.query_arc(Fraction::ZERO, Fraction::from_int(2));
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].whole.begin, Fraction::ZERO);
        assert_eq!(haps[1].whole.begin, Fraction::ONE);
        assert!(haps.iter().all(|h| h.has_onset()));
    }

    #[test]
    fn test_sequence_subdivides_cycle() {
        let p = Pattern::Sequence(vec![atom("bd"), atom("sd"), atom("bd"), atom("sd")]);
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);

        assert_eq!(haps.len(), 4);
        let expected = [
            (frac(0, 1), "bd"),
            (frac(1, 4), "sd"),
            (frac(1, 2), "bd"),
            (frac(3, 4), "sd"),
        ];
        for (hap, (begin, name)) in haps.iter().zip(expected) {
            assert_eq!(hap.whole.begin, begin);
            assert_eq!(hap.value.sample.as_deref(), Some(name));
            assert_eq!(hap.whole.duration(), frac(1, 4));
        }
    }

    #[test]
    fn test_nested_group_subdivides_slot() {
        // "bd [sd sd]" -> sd onsets at 1/2 and 3/4
        let p = Pattern::Sequence(vec![
            atom("bd"),
            Pattern::Sequence(vec![atom("sd"), atom("sd")]),
        ]);
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(
            onsets(&haps),
            vec![(frac(0, 1), "bd"), (frac(1, 2), "sd"), (frac(3, 4), "sd")]
        );
    }

    #[test]
    fn test_partial_arc_clips_without_onset() {
        let p = atom("bd");
        let haps = p.query_arc(frac(1, 4), frac(3, 4));
        assert_eq!(haps.len(), 1);
        assert!(!haps[0].has_onset());
        assert_eq!(haps[0].part.begin, frac(1, 4));
        assert_eq!(haps[0].whole.begin, Fraction::ZERO);
    }

    #[test]
    fn test_cat_alternates_per_cycle() {
        let p = Pattern::Cat(vec![atom("bd"), atom("sd")]);
        let haps = p.query_arc(Fraction::ZERO, Fraction::from_int(4));
        assert_eq!(
            onsets(&haps),
            vec![
                (frac(0, 1), "bd"),
                (frac(1, 1), "sd"),
                (frac(2, 1), "bd"),
                (frac(3, 1), "sd"),
            ]
        );
    }

    #[test]
    fn test_fast_doubles_events() {
        let p = Pattern::Fast(Fraction::from_int(2), Box::new(atom("hh")));
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(haps.len(), 2);
        assert_eq!(haps[0].whole.begin, Fraction::ZERO);
        assert_eq!(haps[1].whole.begin, frac(1, 2));
        assert_eq!(haps[0].whole.duration(), frac(1, 2));
    }

    #[test]
    fn test_slow_stretches_events() {
        let p = Pattern::Slow(Fraction::from_int(2), Box::new(atom("bd")));
        let haps = p.query_arc(Fraction::ZERO, Fraction::from_int(2));
        // One event spanning both cycles
        let with_onset: Vec<_> = haps.iter().filter(|h| h.has_onset()).collect();
        assert_eq!(with_onset.len(), 1);
        assert_eq!(with_onset[0].whole.duration(), Fraction::from_int(2));
    }

    #[test]
    fn test_stack_layers_patterns() {
        let p = Pattern::Stack(vec![atom("bd"), atom("hh")]);
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(haps.len(), 2);
        let names: Vec<_> = haps.iter().map(|h| h.value.sample.as_deref().unwrap()).collect();
        assert!(names.contains(&"bd"));
        assert!(names.contains(&"hh"));
    }

    #[test]
    fn test_control_overlays_all_events() {
        let p = Pattern::Control(
            Control::Gain(0.8),
            Box::new(Pattern::Sequence(vec![atom("bd"), atom("sd")])),
        );
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert!(haps.iter().all(|h| h.value.gain == Some(0.8)));
    }

    #[test]
    fn test_silence_and_empty_span() {
        assert!(Pattern::Silence.query_arc(Fraction::ZERO, Fraction::from_int(10)).is_empty());
        assert!(atom("bd").query_arc(Fraction::ONE, Fraction::ONE).is_empty());
    }

    #[test]
    fn test_sequence_with_rest() {
        let p = Pattern::Sequence(vec![atom("bd"), Pattern::Silence, atom("sd"), Pattern::Silence]);
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(onsets(&haps), vec![(frac(0, 1), "bd"), (frac(1, 2), "sd")]);
    }

    #[test]
    fn test_seven_way_subdivision_is_exact() {
        let items: Vec<Pattern> = (0..7).map(|_| atom("bd")).collect();
        let p = Pattern::Sequence(items);
        let haps = p.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(haps.len(), 7);
        // Last onset lands exactly on 6/7
        assert_eq!(haps[6].whole.begin, frac(6, 7));
        assert_eq!(haps[6].whole.end, Fraction::ONE);
    }

    #[test]
    fn test_query_is_deterministic() {
        let p = Pattern::Stack(vec![
            Pattern::Sequence(vec![atom("bd"), atom("sd")]),
            Pattern::Fast(Fraction::from_int(3), Box::new(atom("hh"))),
        ]);
        let a = p.query_arc(Fraction::ZERO, Fraction::from_int(2));
        let b = p.query_arc(Fraction::ZERO, Fraction::from_int(2));
        assert_eq!(a, b);
    }
}
