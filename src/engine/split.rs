use crate::model::*;

// ── Window splitting ──────────────────────────────────────────────

/// Remainders left when `taken` is carved out of `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carve {
    /// `[window.start, taken.start)`, when non-empty.
    pub prefix: Option<Span>,
    /// `[taken.end, window.end)`, when non-empty.
    pub suffix: Option<Span>,
}

impl Carve {
    pub fn spans(&self) -> impl Iterator<Item = Span> {
        self.prefix.into_iter().chain(self.suffix)
    }
}

/// Split `window` around `taken`. `None` unless `window` fully contains `taken`.
pub fn carve(window: &Span, taken: &Span) -> Option<Carve> {
    if !window.contains_span(taken) {
        return None;
    }
    Some(Carve {
        prefix: Span::try_new(window.start, taken.start),
        suffix: Span::try_new(taken.end, window.end),
    })
}

/// Available windows of the same category that exactly abut `span`.
/// At most one on each side while available windows stay disjoint.
pub fn abutting_windows<'a>(
    windows: &'a [AvailabilityWindow],
    span: &Span,
    category: WindowCategory,
) -> Vec<&'a AvailabilityWindow> {
    windows
        .iter()
        .filter(|w| w.is_available && w.category == category && w.span.abuts(span))
        .collect()
}

/// Union of `span` with neighbours that abut it.
pub fn merge_abutting(span: Span, neighbours: &[Span]) -> Span {
    neighbours.iter().fold(span, |acc, n| {
        Span::new(acc.start.min(n.start), acc.end.max(n.end))
    })
}

/// First span in `taken` that overlaps `span`.
pub fn overlaps_any<'a>(span: &Span, mut taken: impl Iterator<Item = &'a Span>) -> Option<Span> {
    taken.find(|t| t.overlaps(span)).copied()
}
