//! Fair-share (`sshare`) and pending priority (`sprio`) rows.

use crate::layout::ColumnLayout;
use crate::parse::{parse_f64, ParseReport};
use crate::rank::{rank_account_priorities, rank_job_priorities, rank_user_priorities};
use crate::tres::is_absent;
use crate::{AccountPriority, JobPriority, PriorityTables, UserPriority};
use std::collections::BTreeMap;
use tracing::warn;

/// Format string passed to `sprio --format`; widths match [`sprio_layout`].
pub const SPRIO_FORMAT: &str = "%.15i %.12u %.16o %.12r %.12Y %.10A %.10F %.10J %.10Q";

pub fn sprio_layout() -> ColumnLayout {
    ColumnLayout::new(
        &[
            ("JobID", 15),
            ("User", 12),
            ("Account", 16),
            ("Partition", 12),
            ("Priority", 12),
            ("Age", 10),
            ("FairShare", 10),
            ("JobSize", 10),
            ("QOS", 10),
        ],
        1,
    )
}

/// `sshare --noheader -a --format=...` fields.
pub fn sshare_layout() -> ColumnLayout {
    ColumnLayout::new(
        &[
            ("Account", 24),
            ("User", 16),
            ("RawShares", 10),
            ("NormShares", 12),
            ("RawUsage", 14),
            ("NormUsage", 12),
            ("EffectvUsage", 13),
            ("FairShare", 10),
        ],
        1,
    )
}

/// One `sshare` line. An empty user marks an account row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FairShareEntry {
    pub account: String,
    pub user: String,
    pub raw_shares: String,
    pub norm_shares: f64,
    pub raw_usage: f64,
    pub norm_usage: f64,
    pub effective_usage: f64,
    pub fair_share: f64,
}

impl FairShareEntry {
    pub fn is_account_row(&self) -> bool {
        self.user.is_empty()
    }
}

pub fn parse_sshare(raw: &str, layout: &ColumnLayout) -> ParseReport<FairShareEntry> {
    let mut report = ParseReport::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = layout.split_record(line);
        // sshare indents child accounts; the split already trimmed them.
        let account = record.get("Account");
        if account.is_empty() {
            warn!("sshare_line_skipped: {:?}", line.trim_end());
            report.skipped += 1;
            continue;
        }
        let user = record.get("User");
        let context = if user.is_empty() {
            format!("account {account}")
        } else {
            format!("user {user}")
        };
        report.records.push(FairShareEntry {
            account: account.to_string(),
            user: user.to_string(),
            raw_shares: record.get("RawShares").to_string(),
            norm_shares: parse_f64("NormShares", record.get("NormShares"), &context),
            raw_usage: parse_f64("RawUsage", record.get("RawUsage"), &context),
            norm_usage: parse_f64("NormUsage", record.get("NormUsage"), &context),
            effective_usage: parse_f64("EffectvUsage", record.get("EffectvUsage"), &context),
            fair_share: parse_f64("FairShare", record.get("FairShare"), &context),
        });
    }
    report
}

pub fn parse_sprio(raw: &str, layout: &ColumnLayout) -> ParseReport<JobPriority> {
    let mut report = ParseReport::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = layout.split_record(line);
        let job_id = record.get("JobID");
        if job_id.is_empty() || !job_id.starts_with(|ch: char| ch.is_ascii_digit()) {
            warn!("sprio_line_skipped: {:?}", line.trim_end());
            report.skipped += 1;
            continue;
        }
        let context = format!("job {job_id}");
        report.records.push(JobPriority {
            job_id: job_id.to_string(),
            user: record.get("User").to_string(),
            account: record.get("Account").to_string(),
            partition: record.get("Partition").to_string(),
            priority: parse_f64("Priority", record.get("Priority"), &context),
            age: parse_f64("Age", record.get("Age"), &context),
            fair_share: parse_f64("FairShare", record.get("FairShare"), &context),
            job_size: parse_f64("JobSize", record.get("JobSize"), &context),
            qos: parse_f64("QOS", record.get("QOS"), &context),
            rank: String::new(),
        });
    }
    report
}

/// Splits sshare rows into user and account tables and ranks all three.
/// The `root` account row describes the whole cluster and is left out.
pub fn build_priority_tables(
    entries: &[FairShareEntry],
    jobs: Vec<JobPriority>,
) -> PriorityTables {
    let mut users = Vec::new();
    let mut accounts: BTreeMap<String, AccountPriority> = BTreeMap::new();
    let mut user_counts: BTreeMap<String, u32> = BTreeMap::new();

    for entry in entries {
        if entry.is_account_row() {
            if entry.account == "root" {
                continue;
            }
            accounts.insert(
                entry.account.clone(),
                AccountPriority {
                    account: entry.account.clone(),
                    raw_shares: normalize_shares(&entry.raw_shares),
                    norm_shares: entry.norm_shares,
                    raw_usage: entry.raw_usage,
                    norm_usage: entry.norm_usage,
                    effective_usage: entry.effective_usage,
                    fair_share: entry.fair_share,
                    user_count: 0,
                    rank: String::new(),
                },
            );
        } else {
            *user_counts.entry(entry.account.clone()).or_insert(0) += 1;
            users.push(UserPriority {
                username: entry.user.clone(),
                account: entry.account.clone(),
                raw_shares: normalize_shares(&entry.raw_shares),
                norm_shares: entry.norm_shares,
                raw_usage: entry.raw_usage,
                norm_usage: entry.norm_usage,
                effective_usage: entry.effective_usage,
                fair_share: entry.fair_share,
                rank: String::new(),
            });
        }
    }

    for (account, count) in user_counts {
        if let Some(row) = accounts.get_mut(&account) {
            row.user_count = count;
        }
    }

    PriorityTables {
        users: rank_user_priorities(users),
        accounts: rank_account_priorities(accounts.into_values().collect()),
        jobs: rank_job_priorities(jobs),
    }
}

fn normalize_shares(raw: &str) -> String {
    if is_absent(raw) {
        String::new()
    } else {
        raw.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sshare_line(values: &[&str]) -> String {
        sshare_layout().render(values)
    }

    #[test]
    fn sprio_format_matches_layout_widths() {
        let widths: Vec<usize> = SPRIO_FORMAT
            .split_whitespace()
            .map(|spec| {
                spec.trim_start_matches("%.")
                    .trim_end_matches(|ch: char| ch.is_ascii_alphabetic())
                    .parse()
                    .unwrap()
            })
            .collect();
        let layout: Vec<usize> = sprio_layout().columns().iter().map(|c| c.width).collect();
        assert_eq!(widths, layout);
    }

    #[test]
    fn sshare_rows_split_into_users_and_accounts() {
        let raw = [
            sshare_line(&["root", "", "", "0.000000", "1000", "1.000000", "1.000000", ""]),
            sshare_line(&["physics", "", "40", "0.400000", "600", "0.600000", "0.600000", ""]),
            sshare_line(&["physics", "ada", "1", "0.200000", "500", "0.500000", "0.500000", "0.250000"]),
            sshare_line(&["physics", "bob", "parent", "0.200000", "100", "0.100000", "0.100000", "0.750000"]),
            sshare_line(&["bio", "", "60", "0.600000", "400", "0.400000", "0.400000", ""]),
        ]
        .join("\n");
        let report = parse_sshare(&raw, &sshare_layout());
        assert_eq!(report.records.len(), 5);
        let tables = build_priority_tables(&report.records, Vec::new());
        assert_eq!(tables.users.len(), 2);
        assert_eq!(tables.users[0].username, "bob");
        assert_eq!(tables.users[0].rank, "1/2");
        assert_eq!(tables.users[0].raw_shares, "parent");
        assert_eq!(tables.accounts.len(), 2);
        let physics = tables
            .accounts
            .iter()
            .find(|row| row.account == "physics")
            .unwrap();
        assert_eq!(physics.user_count, 2);
    }

    #[test]
    fn sprio_rows_rank_by_priority() {
        let layout = sprio_layout();
        let raw = [
            layout.render(&["101", "ada", "physics", "gpu", "1500", "100", "900", "10", "0"]),
            layout.render(&["102", "bob", "physics", "gpu", "2500", "100", "1900", "10", "0"]),
            layout.render(&["JOBID", "USER"]),
        ]
        .join("\n");
        let report = parse_sprio(&raw, &layout);
        assert_eq!(report.skipped, 1);
        let tables = build_priority_tables(&[], report.records);
        assert_eq!(tables.jobs[0].job_id, "102");
        assert_eq!(tables.jobs[0].rank, "1/2");
        assert_eq!(tables.jobs[1].rank, "2/2");
    }

    #[test]
    fn bad_fair_share_defaults_to_zero() {
        let raw = sshare_line(&["physics", "ada", "1", "x", "500", "0.5", "0.5", "oops"]);
        let report = parse_sshare(&raw, &sshare_layout());
        assert_eq!(report.records[0].fair_share, 0.0);
        assert_eq!(report.records[0].norm_shares, 0.0);
    }
}
