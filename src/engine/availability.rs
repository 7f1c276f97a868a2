use crate::model::*;

// ── Free-window computation ───────────────────────────────────────

/// Free sub-intervals of `query` on a room.
///
/// A room under service or currently occupied has no free windows. Otherwise
/// every scheduled or in-progress booking is cut out of the query window;
/// completed and cancelled bookings do not block.
pub fn free_windows(room: &RoomState, query: &Span) -> Vec<Span> {
    if room.service.is_some() || room.occupant.is_some() {
        return Vec::new();
    }

    let mut taken: Vec<Span> = room
        .overlapping(query)
        .filter(|b| b.status.is_active())
        .map(|b| Span::new(b.span.start.max(query.start), b.span.end.min(query.end)))
        .collect();
    if taken.is_empty() {
        return vec![*query];
    }
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);

    subtract_intervals(&[*query], &taken)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
