#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::Result;
use quorum_sql_domain::{
    hash_bytes, Cell, ConsensusDecision, ConsensusResolution, ResultTable,
};
use tracing::{debug, warn};

/// Absolute tolerance applied to numeric cells when two attempts vote for each other.
pub const VOTE_TOLERANCE: f64 = 0.001;
/// Characters of each result table shown to a judge.
pub const JUDGE_EXCERPT_CHARS: usize = 5_000;

/// A succeeded attempt with its persisted result, in attempt creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusCandidate {
    pub attempt_index: usize,
    pub sql: String,
    pub table: ResultTable,
    pub sql_artifact: PathBuf,
    pub csv_artifact: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ConsensusPolicy {
    pub judge_on_tie: bool,
    pub pick_first_on_tie: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct JudgeVerdict {
    /// Attempt index of the chosen option.
    pub chosen: Option<usize>,
    pub transcript: String,
}

/// Escalation point for ties: something that reads the tied queries and their results and names one.
pub trait Judge {
    #[allow(clippy::missing_errors_doc)]
    fn choose(&self, options: &[&ConsensusCandidate]) -> Result<JudgeVerdict>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConsensusOutcome {
    /// `winner` holds an attempt index.
    pub decision: ConsensusDecision,
    /// Mutual vote count per candidate, by position.
    pub votes: Vec<usize>,
    pub judge_transcript: Option<String>,
}

impl ConsensusOutcome {
    #[must_use]
    pub fn winner<'a>(&self, candidates: &'a [ConsensusCandidate]) -> Option<&'a ConsensusCandidate> {
        let winner = self.decision.winner?;
        candidates
            .iter()
            .find(|candidate| candidate.attempt_index == winner)
    }
}

fn cells_match(left: &Cell, right: &Cell, tolerance: f64) -> bool {
    match (left, right) {
        (Cell::Null, Cell::Null) => true,
        (Cell::Text(left), Cell::Text(right)) => left == right,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => (left - right).abs() <= tolerance,
            _ => false,
        },
    }
}

fn sort_rank(cell: &Cell) -> u8 {
    match cell {
        Cell::Integer(_) | Cell::Real(_) => 0,
        Cell::Text(_) => 1,
        Cell::Null => 2,
    }
}

fn compare_cells(left: &Cell, right: &Cell) -> Ordering {
    sort_rank(left)
        .cmp(&sort_rank(right))
        .then_with(|| match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => left.total_cmp(&right),
            _ => left.render().cmp(&right.render()),
        })
}

fn vectors_match(left: &[Cell], right: &[Cell], ignore_order: bool, tolerance: f64) -> bool {
    if left.len() != right.len() {
        return false;
    }
    if ignore_order {
        let mut left = left.to_vec();
        let mut right = right.to_vec();
        left.sort_by(compare_cells);
        right.sort_by(compare_cells);
        return left
            .iter()
            .zip(&right)
            .all(|(a, b)| cells_match(a, b, tolerance));
    }
    left.iter()
        .zip(right)
        .all(|(a, b)| cells_match(a, b, tolerance))
}

/// Column-wise comparison: every column of `gold` must equal some column of `pred`.
/// Column names and column order are ignored; with `ignore_order` each column is compared as a
/// multiset.
#[must_use]
pub fn tables_equivalent(
    pred: &ResultTable,
    gold: &ResultTable,
    ignore_order: bool,
    tolerance: f64,
) -> bool {
    let pred_columns: Vec<Vec<Cell>> = (0..pred.columns.len())
        .map(|index| pred.column(index))
        .collect();
    (0..gold.columns.len()).all(|index| {
        let gold_column = gold.column(index);
        pred_columns
            .iter()
            .any(|candidate| vectors_match(&gold_column, candidate, ignore_order, tolerance))
    })
}

/// Text cells that span several lines.
#[must_use]
pub fn nested_values(table: &ResultTable) -> Vec<String> {
    table
        .rows
        .iter()
        .flatten()
        .filter_map(|cell| match cell {
            Cell::Text(text) if text.contains('\n') => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Columns whose every cell is `0` or empty.
#[must_use]
pub fn degenerate_columns(table: &ResultTable) -> Vec<String> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(index, _)| {
            table.column(*index).iter().all(|cell| {
                let rendered = cell.render();
                rendered.is_empty() || rendered == "0"
            })
        })
        .map(|(_, name)| name.clone())
        .collect()
}

#[must_use]
pub fn is_valid_result(table: &ResultTable) -> bool {
    nested_values(table).is_empty() && degenerate_columns(table).is_empty()
}

/// Hash of the row values with reals rounded to two decimals. Headers are not part of it.
#[must_use]
pub fn consistency_fingerprint(table: &ResultTable, ignore_row_order: bool) -> String {
    let mut rows: Vec<String> = table
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Cell::Real(value) => format!("{value:.2}"),
                    other => other.render(),
                })
                .collect::<Vec<_>>()
                .join("\u{1f}")
        })
        .collect();
    if ignore_row_order {
        rows.sort();
    }
    hash_bytes(rows.join("\n").as_bytes())
}

/// Reciprocated agreement between candidates, by position.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VoteGraph {
    mutual: Vec<Vec<usize>>,
}

impl VoteGraph {
    #[must_use]
    pub fn build(candidates: &[ConsensusCandidate]) -> Self {
        let valid: Vec<bool> = candidates
            .iter()
            .map(|candidate| is_valid_result(&candidate.table))
            .collect();
        let agrees = |from: usize, to: usize| {
            let (source, target) = (&candidates[from].table, &candidates[to].table);
            from != to
                && valid[to]
                && source.shape() == target.shape()
                && tables_equivalent(target, source, true, VOTE_TOLERANCE)
        };

        let mut mutual = vec![Vec::new(); candidates.len()];
        for from in 0..candidates.len() {
            for to in (from + 1)..candidates.len() {
                if agrees(from, to) && agrees(to, from) {
                    mutual[from].push(to);
                    mutual[to].push(from);
                }
            }
        }
        for neighbours in &mut mutual {
            neighbours.sort_unstable();
        }
        Self { mutual }
    }

    #[must_use]
    pub fn neighbours(&self, position: usize) -> &[usize] {
        self.mutual.get(position).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn votes(&self) -> Vec<usize> {
        self.mutual.iter().map(Vec::len).collect()
    }

    /// Connected component label per position; a label is the lowest position in its component.
    #[must_use]
    pub fn components(&self) -> Vec<usize> {
        let mut labels = vec![usize::MAX; self.mutual.len()];
        for root in 0..self.mutual.len() {
            if labels[root] != usize::MAX {
                continue;
            }
            let mut stack = vec![root];
            labels[root] = root;
            while let Some(position) = stack.pop() {
                for &next in &self.mutual[position] {
                    if labels[next] == usize::MAX {
                        labels[next] = root;
                        stack.push(next);
                    }
                }
            }
        }
        labels
    }
}

struct Ballot<'a> {
    candidates: &'a [ConsensusCandidate],
    components: Vec<usize>,
    votes: Vec<usize>,
}

impl Ballot<'_> {
    fn support(&self, position: usize) -> usize {
        let label = self.components[position];
        self.components
            .iter()
            .filter(|other| **other == label)
            .count()
    }

    fn decide(
        &self,
        position: Option<usize>,
        vote_count: usize,
        tie: bool,
        resolution: ConsensusResolution,
    ) -> ConsensusDecision {
        ConsensusDecision {
            winner: position.map(|position| self.candidates[position].attempt_index),
            vote_count,
            support: position.map_or(0, |position| self.support(position)),
            tie,
            resolution,
        }
    }

    /// Judge first, then pick-first, then abstain.
    fn break_tie(
        &self,
        options: &[usize],
        vote_count: usize,
        tie: bool,
        policy: ConsensusPolicy,
        judge: Option<&dyn Judge>,
    ) -> (ConsensusDecision, Option<String>) {
        let mut transcript = None;
        if let Some(judge) = judge.filter(|_| policy.judge_on_tie && options.len() > 1) {
            let offered: Vec<&ConsensusCandidate> = options
                .iter()
                .map(|position| &self.candidates[*position])
                .collect();
            match judge.choose(&offered) {
                Ok(verdict) => {
                    transcript = Some(verdict.transcript);
                    let chosen = verdict.chosen.and_then(|attempt| {
                        options
                            .iter()
                            .copied()
                            .find(|position| self.candidates[*position].attempt_index == attempt)
                    });
                    if let Some(position) = chosen {
                        return (
                            self.decide(Some(position), vote_count, tie, ConsensusResolution::Judge),
                            transcript,
                        );
                    }
                    warn!(options = options.len(), "judge named no offered candidate");
                }
                Err(err) => warn!(error = %err, "judge failed"),
            }
        }
        if policy.pick_first_on_tie {
            let first = options.first().copied();
            return (
                self.decide(first, vote_count, tie, ConsensusResolution::PickFirst),
                transcript,
            );
        }
        (
            self.decide(None, vote_count, tie, ConsensusResolution::Abstained),
            transcript,
        )
    }
}

/// Pick one candidate by mutual agreement of result tables.
///
/// The vote of a candidate is the number of other candidates it agrees with in both directions.
/// The cluster holding the highest non-zero vote wins; several clusters at that vote are a tie.
#[must_use]
pub fn resolve(
    candidates: &[ConsensusCandidate],
    policy: ConsensusPolicy,
    judge: Option<&dyn Judge>,
) -> ConsensusOutcome {
    if candidates.is_empty() {
        return ConsensusOutcome {
            decision: ConsensusDecision {
                winner: None,
                vote_count: 0,
                support: 0,
                tie: false,
                resolution: ConsensusResolution::NoCandidates,
            },
            votes: Vec::new(),
            judge_transcript: None,
        };
    }

    let graph = VoteGraph::build(candidates);
    let ballot = Ballot {
        candidates,
        components: graph.components(),
        votes: graph.votes(),
    };
    let top = ballot.votes.iter().copied().max().unwrap_or(0);
    debug!(candidates = candidates.len(), top_vote = top, "votes counted");

    let (decision, judge_transcript) = if top == 0 {
        let everyone: Vec<usize> = (0..candidates.len()).collect();
        let judged = policy.judge_on_tie && judge.is_some() && candidates.len() > 1;
        ballot.break_tie(
            &everyone,
            usize::from(judged),
            candidates.len() > 1,
            policy,
            judge,
        )
    } else {
        let leaders: Vec<usize> = (0..candidates.len())
            .filter(|position| ballot.votes[*position] == top)
            .collect();
        let mut clusters: Vec<usize> = leaders
            .iter()
            .map(|position| ballot.components[*position])
            .collect();
        clusters.sort_unstable();
        clusters.dedup();
        if clusters.len() == 1 {
            (
                ballot.decide(
                    leaders.first().copied(),
                    top,
                    false,
                    ConsensusResolution::Majority,
                ),
                None,
            )
        } else {
            ballot.break_tie(&leaders, top, true, policy, judge)
        }
    };

    ConsensusOutcome {
        decision,
        votes: ballot.votes,
        judge_transcript,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        consistency_fingerprint, degenerate_columns, nested_values, resolve, tables_equivalent,
        ConsensusCandidate, ConsensusPolicy, Judge, JudgeVerdict, VoteGraph, VOTE_TOLERANCE,
    };
    use anyhow::{anyhow, Result};
    use proptest::prelude::*;
    use quorum_sql_domain::{Cell, ConsensusResolution, ResultTable};
    use std::cell::RefCell;
    use std::path::PathBuf;

    fn table(columns: &[&str], rows: Vec<Vec<Cell>>) -> ResultTable {
        ResultTable::new(columns.iter().map(ToString::to_string).collect(), rows)
    }

    fn numbers(values: &[i64]) -> ResultTable {
        table(
            &["n"],
            values.iter().map(|value| vec![Cell::Integer(*value)]).collect(),
        )
    }

    fn candidate(attempt_index: usize, table: ResultTable) -> ConsensusCandidate {
        ConsensusCandidate {
            attempt_index,
            sql: format!("SELECT {attempt_index};"),
            table,
            sql_artifact: PathBuf::from(format!("{attempt_index}result.sql")),
            csv_artifact: PathBuf::from(format!("{attempt_index}result.csv")),
        }
    }

    struct RecordingJudge {
        pick: Option<usize>,
        fail: bool,
        offered: RefCell<Vec<Vec<usize>>>,
    }

    impl RecordingJudge {
        fn picking(pick: Option<usize>) -> Self {
            Self {
                pick,
                fail: false,
                offered: RefCell::new(Vec::new()),
            }
        }
    }

    impl Judge for RecordingJudge {
        fn choose(&self, options: &[&ConsensusCandidate]) -> Result<JudgeVerdict> {
            self.offered
                .borrow_mut()
                .push(options.iter().map(|option| option.attempt_index).collect());
            if self.fail {
                return Err(anyhow!("judge unavailable"));
            }
            Ok(JudgeVerdict {
                chosen: self.pick,
                transcript: "[Vote]".to_string(),
            })
        }
    }

    #[test]
    fn equivalence_ignores_row_order_and_column_names() {
        let gold = table(
            &["city", "total"],
            vec![
                vec![Cell::Text("a".into()), Cell::Integer(1)],
                vec![Cell::Text("b".into()), Cell::Integer(2)],
            ],
        );
        let pred = table(
            &["total_sales", "name"],
            vec![
                vec![Cell::Real(2.0005), Cell::Text("b".into())],
                vec![Cell::Real(1.0), Cell::Text("a".into())],
            ],
        );
        assert!(tables_equivalent(&pred, &gold, true, VOTE_TOLERANCE));
        assert!(!tables_equivalent(&pred, &gold, false, VOTE_TOLERANCE));
    }

    #[test]
    fn numeric_tolerance_is_absolute() {
        let gold = table(&["x"], vec![vec![Cell::Real(1.0)]]);
        let close = table(&["x"], vec![vec![Cell::Real(1.0009)]]);
        let far = table(&["x"], vec![vec![Cell::Real(1.01)]]);
        assert!(tables_equivalent(&close, &gold, true, VOTE_TOLERANCE));
        assert!(!tables_equivalent(&far, &gold, true, VOTE_TOLERANCE));
        let text = table(&["x"], vec![vec![Cell::Text("1.0".into())]]);
        assert!(!tables_equivalent(&text, &gold, true, VOTE_TOLERANCE));
    }

    #[test]
    fn degenerate_and_nested_cells_are_reported() {
        let result = table(
            &["id", "zeros", "blank", "tags"],
            vec![
                vec![Cell::Integer(1), Cell::Integer(0), Cell::Null, Cell::Text("a\nb".into())],
                vec![Cell::Integer(2), Cell::Integer(0), Cell::Text(String::new()), Cell::Text("c".into())],
            ],
        );
        assert_eq!(degenerate_columns(&result), vec!["zeros", "blank"]);
        assert_eq!(nested_values(&result), vec!["a\nb"]);
        assert!(degenerate_columns(&numbers(&[0, 3])).is_empty());
    }

    #[test]
    fn fingerprint_rounds_reals_and_ignores_row_order() {
        let first = table(
            &["k", "v"],
            vec![
                vec![Cell::Text("a".into()), Cell::Real(1.234)],
                vec![Cell::Text("b".into()), Cell::Real(2.0)],
            ],
        );
        let second = table(
            &["key", "value"],
            vec![
                vec![Cell::Text("b".into()), Cell::Real(2.001)],
                vec![Cell::Text("a".into()), Cell::Real(1.2349)],
            ],
        );
        assert_eq!(
            consistency_fingerprint(&first, true),
            consistency_fingerprint(&second, true)
        );
        assert_ne!(
            consistency_fingerprint(&first, false),
            consistency_fingerprint(&second, false)
        );
    }

    #[test]
    fn identical_pair_outvotes_distinct_third() {
        let candidates = vec![
            candidate(0, numbers(&[1, 2])),
            candidate(1, numbers(&[2, 1])),
            candidate(2, numbers(&[7, 8])),
        ];
        let outcome = resolve(&candidates, ConsensusPolicy::default(), None);
        assert_eq!(outcome.votes, vec![1, 1, 0]);
        assert_eq!(outcome.decision.winner, Some(0));
        assert_eq!(outcome.decision.support, 2);
        assert_eq!(outcome.decision.vote_count, 1);
        assert!(!outcome.decision.tie);
        assert_eq!(outcome.decision.resolution, ConsensusResolution::Majority);
        assert_eq!(
            outcome.winner(&candidates).map(|winner| winner.attempt_index),
            Some(0)
        );
    }

    #[test]
    fn three_distinct_tables_without_policy_abstain() {
        let candidates = vec![
            candidate(0, numbers(&[1])),
            candidate(1, numbers(&[2])),
            candidate(2, numbers(&[3])),
        ];
        let outcome = resolve(&candidates, ConsensusPolicy::default(), None);
        assert_eq!(outcome.decision.winner, None);
        assert!(outcome.decision.tie);
        assert_eq!(outcome.decision.resolution, ConsensusResolution::Abstained);
    }

    #[test]
    fn two_clusters_tie_goes_to_judge_then_pick_first() {
        let candidates = vec![
            candidate(0, numbers(&[1])),
            candidate(1, numbers(&[1])),
            candidate(2, numbers(&[5])),
            candidate(3, numbers(&[5])),
        ];
        let judge = RecordingJudge::picking(Some(2));
        let policy = ConsensusPolicy {
            judge_on_tie: true,
            pick_first_on_tie: true,
        };
        let outcome = resolve(&candidates, policy, Some(&judge));
        assert_eq!(outcome.decision.winner, Some(2));
        assert_eq!(outcome.decision.resolution, ConsensusResolution::Judge);
        assert_eq!(outcome.decision.support, 2);
        assert!(outcome.decision.tie);
        assert_eq!(judge.offered.borrow().clone(), vec![vec![0, 1, 2, 3]]);
        assert_eq!(outcome.judge_transcript.as_deref(), Some("[Vote]"));

        let unknown = RecordingJudge::picking(Some(9));
        let outcome = resolve(&candidates, policy, Some(&unknown));
        assert_eq!(outcome.decision.winner, Some(0));
        assert_eq!(outcome.decision.resolution, ConsensusResolution::PickFirst);
    }

    #[test]
    fn failing_judge_without_pick_first_abstains() {
        let candidates = vec![candidate(0, numbers(&[1])), candidate(1, numbers(&[2]))];
        let judge = RecordingJudge {
            pick: None,
            fail: true,
            offered: RefCell::new(Vec::new()),
        };
        let policy = ConsensusPolicy {
            judge_on_tie: true,
            pick_first_on_tie: false,
        };
        let outcome = resolve(&candidates, policy, Some(&judge));
        assert_eq!(outcome.decision.resolution, ConsensusResolution::Abstained);
        assert_eq!(outcome.decision.vote_count, 1);
        assert_eq!(judge.offered.borrow().len(), 1);
    }

    #[test]
    fn single_candidate_never_consults_judge() {
        let candidates = vec![candidate(4, numbers(&[1]))];
        let judge = RecordingJudge::picking(Some(4));
        let policy = ConsensusPolicy {
            judge_on_tie: true,
            pick_first_on_tie: true,
        };
        let outcome = resolve(&candidates, policy, Some(&judge));
        assert!(judge.offered.borrow().is_empty());
        assert_eq!(outcome.decision.winner, Some(4));
        assert_eq!(outcome.decision.resolution, ConsensusResolution::PickFirst);
        assert!(!outcome.decision.tie);
    }

    #[test]
    fn degenerate_tables_receive_no_votes() {
        let candidates = vec![
            candidate(0, numbers(&[0, 0])),
            candidate(1, numbers(&[0, 0])),
        ];
        let graph = VoteGraph::build(&candidates);
        assert_eq!(graph.votes(), vec![0, 0]);
        assert!(graph.neighbours(0).is_empty());
        let outcome = resolve(&candidates, ConsensusPolicy::default(), None);
        assert_eq!(outcome.decision.resolution, ConsensusResolution::Abstained);
    }

    #[test]
    fn shape_mismatch_blocks_agreement() {
        let wide = table(
            &["n", "m"],
            vec![vec![Cell::Integer(1), Cell::Integer(2)]],
        );
        let candidates = vec![candidate(0, numbers(&[1])), candidate(1, wide)];
        assert_eq!(VoteGraph::build(&candidates).votes(), vec![0, 0]);
    }

    #[test]
    fn components_follow_mutual_edges() {
        let candidates = vec![
            candidate(0, numbers(&[3])),
            candidate(1, numbers(&[9])),
            candidate(2, numbers(&[3])),
        ];
        let graph = VoteGraph::build(&candidates);
        assert_eq!(graph.components(), vec![0, 1, 0]);
        assert_eq!(graph.neighbours(2), &[0]);
    }

    #[test]
    fn no_candidates_is_reported() {
        let outcome = resolve(&[], ConsensusPolicy::default(), None);
        assert_eq!(outcome.decision.resolution, ConsensusResolution::NoCandidates);
        assert!(outcome.votes.is_empty());
    }

    fn rows_strategy() -> impl Strategy<Value = Vec<(i64, String, i32)>> {
        prop::collection::vec((0i64..50, "[a-c]{1,3}", 0i32..1000), 1..24)
    }

    fn as_table(rows: &[(i64, String, i32)], jitter: &[f64]) -> ResultTable {
        table(
            &["id", "label", "amount"],
            rows.iter()
                .enumerate()
                .map(|(index, (id, label, amount))| {
                    let offset = jitter.get(index).copied().unwrap_or(0.0);
                    vec![
                        Cell::Integer(*id),
                        Cell::Text(label.clone()),
                        Cell::Real(f64::from(*amount) / 10.0 + offset),
                    ]
                })
                .collect(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_row_permutation_preserves_equivalence(
            (rows, shuffled) in rows_strategy()
                .prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
        ) {
            let gold = as_table(&rows, &[]);
            let pred = as_table(&shuffled, &[]);
            prop_assert!(tables_equivalent(&pred, &gold, true, VOTE_TOLERANCE));
            prop_assert!(tables_equivalent(&gold, &pred, true, VOTE_TOLERANCE));
        }

        #[test]
        fn prop_jitter_within_tolerance_is_equivalent(
            rows in rows_strategy(),
            jitter in prop::collection::vec(-0.0009f64..0.0009, 24)
        ) {
            let gold = as_table(&rows, &[]);
            let pred = as_table(&rows, &jitter);
            prop_assert!(tables_equivalent(&pred, &gold, true, VOTE_TOLERANCE));
            prop_assert!(tables_equivalent(&pred, &gold, false, VOTE_TOLERANCE));
        }
    }
}
