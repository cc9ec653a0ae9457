//! Dense ranking for the priority tables.

use crate::{AccountPriority, JobPriority, UserPriority};
use std::cmp::Ordering;

/// Dense `r/n` ranks aligned with the input order. Higher values rank first,
/// ties share a rank and the next distinct value is exactly one rank lower.
/// NaN ranks after every number.
pub fn dense_rank(values: &[f64]) -> Vec<String> {
    let total = values.len();
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by(|a, b| descending(values[*a], values[*b]));

    let mut ranks = vec![String::new(); total];
    let mut rank = 0usize;
    let mut previous: Option<f64> = None;
    for idx in order {
        let value = values[idx];
        let same = match previous {
            Some(prev) => prev == value || (prev.is_nan() && value.is_nan()),
            None => false,
        };
        if !same {
            rank += 1;
        }
        previous = Some(value);
        ranks[idx] = format!("{rank}/{total}");
    }
    ranks
}

fn descending(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Ranks by fair share and returns rows in rank order (ties by name).
pub fn rank_user_priorities(mut rows: Vec<UserPriority>) -> Vec<UserPriority> {
    rows.sort_by(|a, b| {
        descending(a.fair_share, b.fair_share)
            .then_with(|| a.username.cmp(&b.username))
            .then_with(|| a.account.cmp(&b.account))
    });
    let values: Vec<f64> = rows.iter().map(|row| row.fair_share).collect();
    for (row, rank) in rows.iter_mut().zip(dense_rank(&values)) {
        row.rank = rank;
    }
    rows
}

pub fn rank_account_priorities(mut rows: Vec<AccountPriority>) -> Vec<AccountPriority> {
    rows.sort_by(|a, b| {
        descending(a.fair_share, b.fair_share).then_with(|| a.account.cmp(&b.account))
    });
    let values: Vec<f64> = rows.iter().map(|row| row.fair_share).collect();
    for (row, rank) in rows.iter_mut().zip(dense_rank(&values)) {
        row.rank = rank;
    }
    rows
}

pub fn rank_job_priorities(mut rows: Vec<JobPriority>) -> Vec<JobPriority> {
    rows.sort_by(|a, b| descending(a.priority, b.priority).then_with(|| a.job_id.cmp(&b.job_id)));
    let values: Vec<f64> = rows.iter().map(|row| row.priority).collect();
    for (row, rank) in rows.iter_mut().zip(dense_rank(&values)) {
        row.rank = rank;
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_share_rank_and_next_increments_by_one() {
        assert_eq!(
            dense_rank(&[0.9, 0.5, 0.5, 0.2]),
            vec!["1/4", "2/4", "2/4", "3/4"]
        );
    }

    #[test]
    fn ranks_follow_input_positions() {
        assert_eq!(dense_rank(&[0.2, 0.9, 0.5]), vec!["3/3", "1/3", "2/3"]);
        assert!(dense_rank(&[]).is_empty());
    }

    #[test]
    fn nan_ranks_last() {
        assert_eq!(dense_rank(&[f64::NAN, 0.1]), vec!["2/2", "1/2"]);
    }

    #[test]
    fn user_ranks_survive_resorting() {
        let rows = vec![
            UserPriority {
                username: "cy".to_string(),
                fair_share: 0.2,
                ..UserPriority::default()
            },
            UserPriority {
                username: "ada".to_string(),
                fair_share: 0.5,
                ..UserPriority::default()
            },
            UserPriority {
                username: "bob".to_string(),
                fair_share: 0.5,
                ..UserPriority::default()
            },
        ];
        let mut ranked = rank_user_priorities(rows);
        assert_eq!(ranked[0].username, "ada");
        assert_eq!(ranked[1].rank, "1/3");
        ranked.sort_by(|a, b| b.username.cmp(&a.username));
        assert_eq!(ranked[0].username, "cy");
        assert_eq!(ranked[0].rank, "2/3");
    }
}
