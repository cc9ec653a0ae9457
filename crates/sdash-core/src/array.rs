//! Array job sizing for pending demand.

/// Number of tasks a pending array row stands for.
///
/// `123_[0-99%5]` is 100 tasks, `123_[1,3,5,7-10]` is 7, a single running
/// element such as `123_4` or a plain id is 1. Malformed pieces count as one
/// task each so demand is never under-reported to zero.
pub fn array_size(job_id: &str) -> u32 {
    let Some(open) = job_id.find("_[") else {
        return 1;
    };
    let body = &job_id[open + 2..];
    let body = body.split(']').next().unwrap_or(body);
    let body = body.split('%').next().unwrap_or(body);

    let mut total: u32 = 0;
    for piece in body.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        total = total.saturating_add(range_len(piece));
    }
    total.max(1)
}

fn range_len(piece: &str) -> u32 {
    // Step syntax `0-15:4` is accepted.
    let (range, step) = match piece.split_once(':') {
        Some((range, step)) => (range, step.trim().parse::<u32>().unwrap_or(1).max(1)),
        None => (piece, 1),
    };
    match range.split_once('-') {
        Some((start, end)) => match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
            (Ok(start), Ok(end)) if end >= start => ((end - start) / step).saturating_add(1),
            _ => 1,
        },
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_element_ids_are_single() {
        assert_eq!(array_size("12345"), 1);
        assert_eq!(array_size("12345_7"), 1);
        assert_eq!(array_size(""), 1);
    }

    #[test]
    fn ranges_with_throttle() {
        assert_eq!(array_size("12345_[0-99%5]"), 100);
        assert_eq!(array_size("12345_[0-9]"), 10);
        assert_eq!(array_size("12345_[5]"), 1);
    }

    #[test]
    fn comma_lists_mix_singles_and_ranges() {
        assert_eq!(array_size("12345_[1,3,5,7-10]"), 7);
    }

    #[test]
    fn step_ranges() {
        assert_eq!(array_size("9_[0-15:4]"), 4);
    }

    #[test]
    fn malformed_pieces_count_once() {
        assert_eq!(array_size("9_[x-y,4]"), 2);
        assert_eq!(array_size("9_[10-2]"), 1);
        assert_eq!(array_size("9_[]"), 1);
    }

    #[test]
    fn full_u32_range_saturates() {
        assert_eq!(array_size("9_[0-4294967295]"), u32::MAX);
        assert_eq!(array_size("9_[0-4294967295,1-2]"), u32::MAX);
    }
}
