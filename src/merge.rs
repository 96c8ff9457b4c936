//! Outer-join per-column series into one wide table, forward-fill gaps and
//! estimate the sampling interval.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::range::ColumnSeries;

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub dt: DateTime<FixedOffset>,
    pub values: Vec<Option<f64>>,
}

/// Rows strictly ascending by `dt`; `values[i]` belongs to `columns[i]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergedTable {
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl MergedTable {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    /// True when at least one cell holds a value.
    pub fn has_values(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.values.iter().any(Option::is_some))
    }

    pub fn null_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.values.iter().filter(|value| value.is_none()).count())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    /// Nulls right after the outer join.
    pub missing_before_fill: usize,
    /// Leading nulls that forward-fill could not reach.
    pub missing_after_fill: usize,
    pub duplicate_points_replaced: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub table: MergedTable,
    pub report: MergeReport,
    pub interval_minutes: u32,
}

pub fn merge(series: &[ColumnSeries]) -> Result<MergeOutcome, IngestError> {
    if series.is_empty() {
        return Err(IngestError::EmptyMerge);
    }

    let width = series.len();
    // keyed by epoch millis so the same instant in different offsets lands on one row
    let mut rows: BTreeMap<i64, TableRow> = BTreeMap::new();
    let mut duplicate_points_replaced = 0;

    for (idx, column) in series.iter().enumerate() {
        for point in &column.points {
            let row = rows
                .entry(point.ts.timestamp_millis())
                .or_insert_with(|| TableRow {
                    dt: point.ts,
                    values: vec![None; width],
                });
            if row.values[idx].is_some() {
                duplicate_points_replaced += 1;
            }
            // last observation wins for a repeated instant
            row.values[idx] = point.value;
        }
    }

    if rows.is_empty() {
        return Err(IngestError::EmptyMerge);
    }

    let mut table = MergedTable {
        columns: series.iter().map(|s| s.column.clone()).collect(),
        rows: rows.into_values().collect(),
    };

    let missing_before_fill = table.null_count();
    forward_fill(&mut table);
    let missing_after_fill = table.null_count();
    let interval_minutes = infer_interval_minutes(&table);

    if duplicate_points_replaced > 0 {
        warn!(
            component = "merge",
            event = "merge.duplicates.replaced",
            count = duplicate_points_replaced
        );
    }
    debug!(
        component = "merge",
        event = "merge.complete",
        rows = table.n_rows(),
        columns = table.columns.len(),
        missing_before_fill,
        missing_after_fill,
        interval_minutes
    );

    Ok(MergeOutcome {
        table,
        report: MergeReport {
            missing_before_fill,
            missing_after_fill,
            duplicate_points_replaced,
        },
        interval_minutes,
    })
}

/// Each null takes the most recent non-null value above it in the same column.
/// Leading nulls stay null. Idempotent.
pub fn forward_fill(table: &mut MergedTable) {
    let mut last: Vec<Option<f64>> = vec![None; table.columns.len()];
    for row in &mut table.rows {
        for (slot, value) in last.iter_mut().zip(row.values.iter_mut()) {
            match value {
                Some(v) => *slot = Some(*v),
                None => *value = *slot,
            }
        }
    }
}

/// Median gap between consecutive rows, rounded to whole minutes. Under two rows gives 0.
pub fn infer_interval_minutes(table: &MergedTable) -> u32 {
    let mut deltas: Vec<i64> = table
        .rows
        .windows(2)
        .map(|pair| pair[1].dt.timestamp_millis() - pair[0].dt.timestamp_millis())
        .collect();
    if deltas.is_empty() {
        return 0;
    }

    deltas.sort_unstable();
    let mid = deltas.len() / 2;
    let median_ms = if deltas.len() % 2 == 0 {
        (deltas[mid - 1] as f64 + deltas[mid] as f64) / 2.0
    } else {
        deltas[mid] as f64
    };

    let minutes = (median_ms / 60_000.0).round();
    if minutes.is_finite() && minutes > 0.0 {
        minutes.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::HistoryPoint;
    use chrono::TimeZone;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(7 * 3_600).unwrap()
    }

    fn at_minute(minute: i64) -> DateTime<FixedOffset> {
        offset()
            .timestamp_millis_opt(1_757_437_200_000 + minute * 60_000)
            .single()
            .unwrap()
    }

    fn series(column: &str, points: &[(i64, Option<f64>)]) -> ColumnSeries {
        ColumnSeries {
            column: column.to_string(),
            points: points
                .iter()
                .map(|(minute, value)| HistoryPoint {
                    ts: at_minute(*minute),
                    value: *value,
                })
                .collect(),
        }
    }

    #[test]
    fn outer_join_then_forward_fill() {
        let a = series("A", &[(1, Some(1.0)), (2, Some(2.0)), (3, Some(3.0))]);
        let b = series("B", &[(1, Some(10.0)), (3, Some(30.0)), (5, Some(50.0))]);

        let outcome = merge(&[a, b]).unwrap();
        let table = &outcome.table;

        assert_eq!(table.columns, vec!["A", "B"]);
        let dts: Vec<_> = table.rows.iter().map(|row| row.dt).collect();
        assert_eq!(dts, vec![at_minute(1), at_minute(2), at_minute(3), at_minute(5)]);

        let values: Vec<_> = table.rows.iter().map(|row| row.values.clone()).collect();
        assert_eq!(
            values,
            vec![
                vec![Some(1.0), Some(10.0)],
                vec![Some(2.0), Some(10.0)],
                vec![Some(3.0), Some(30.0)],
                vec![Some(3.0), Some(50.0)],
            ]
        );
        assert_eq!(outcome.report.missing_before_fill, 2);
        assert_eq!(outcome.report.missing_after_fill, 0);
    }

    #[test]
    fn leading_nulls_are_reported_not_invented() {
        let a = series("A", &[(1, Some(1.0)), (2, Some(2.0))]);
        let b = series("B", &[(2, Some(20.0))]);

        let outcome = merge(&[a, b]).unwrap();
        assert_eq!(outcome.table.rows[0].values, vec![Some(1.0), None]);
        assert_eq!(outcome.report.missing_after_fill, 1);
    }

    #[test]
    fn median_interval_resists_outlier_gap() {
        let minutes = [0, 5, 10, 15, 75, 80, 85];
        let points: Vec<(i64, Option<f64>)> = minutes.iter().map(|m| (*m, Some(1.0))).collect();
        let outcome = merge(&[series("A", &points)]).unwrap();
        assert_eq!(outcome.interval_minutes, 5);
    }

    #[test]
    fn interval_is_zero_for_single_row_and_rounds_sub_minute() {
        let single = merge(&[series("A", &[(0, Some(1.0))])]).unwrap();
        assert_eq!(single.interval_minutes, 0);

        let mut table = MergedTable {
            columns: vec!["A".to_string()],
            rows: Vec::new(),
        };
        for (idx, seconds) in [0_i64, 100, 200].iter().enumerate() {
            table.rows.push(TableRow {
                dt: offset().timestamp_opt(1_757_437_200 + seconds, 0).single().unwrap(),
                values: vec![Some(idx as f64)],
            });
        }
        assert_eq!(infer_interval_minutes(&table), 2);
    }

    #[test]
    fn forward_fill_is_idempotent() {
        let a = series("A", &[(1, None), (2, Some(2.0)), (4, None)]);
        let b = series("B", &[(3, Some(3.0))]);
        let mut table = merge(&[a, b]).unwrap().table;

        let once = table.clone();
        forward_fill(&mut table);
        assert_eq!(table, once);
    }

    #[test]
    fn duplicate_instants_keep_last_value() {
        let a = series("A", &[(1, Some(1.0)), (1, Some(9.0)), (2, Some(2.0))]);
        let outcome = merge(&[a]).unwrap();
        assert_eq!(outcome.table.n_rows(), 2);
        assert_eq!(outcome.table.rows[0].values, vec![Some(9.0)]);
        assert_eq!(outcome.report.duplicate_points_replaced, 1);
    }

    #[test]
    fn merging_the_same_series_twice_gives_the_same_outcome() {
        let input = vec![
            series("A", &[(1, Some(1.0)), (1, Some(1.5)), (3, None), (4, Some(4.0))]),
            series("B", &[(0, None), (1, Some(10.0)), (4, Some(40.0)), (4, Some(41.0))]),
            series("C", &[(2, Some(200.0))]),
        ];

        let first = merge(&input).unwrap();
        let second = merge(&input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.report.duplicate_points_replaced, 2);

        let mut refilled = first.table.clone();
        forward_fill(&mut refilled);
        assert_eq!(refilled, first.table);
    }

    #[test]
    fn all_null_rows_have_no_values() {
        let outcome = merge(&[series("A", &[(1, None), (2, None)])]).unwrap();
        assert_eq!(outcome.table.n_rows(), 2);
        assert!(!outcome.table.has_values());

        let filled = merge(&[series("A", &[(1, None), (2, Some(2.0))])]).unwrap();
        assert!(filled.table.has_values());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(merge(&[]).unwrap_err(), IngestError::EmptyMerge));
        assert!(matches!(
            merge(&[series("A", &[]), series("B", &[])]).unwrap_err(),
            IngestError::EmptyMerge
        ));
    }
}
