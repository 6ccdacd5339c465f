// Copyright (c) 2023 - 2025 Tessera Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bulk-import planning: map externally written files onto tablets, refuse
//! imports that would blow a tablet's file budget, and hand the mapping to
//! the fate steps that apply it atomically per tablet.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tessera_metadata::{Ample, MetadataStore};
use tessera_types::config::TableOptions;
use tessera_types::{ColumnSet, ColumnType, FencedRange, KeyExtent, StoredFile, TableId};

/// How a load-plan entry describes a file's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeType {
    /// The caller asserts the range matches existing tablet boundaries.
    Table,
    /// The file is fenced to exactly `(start, end]`.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadPlanEntry {
    pub file_name: String,
    pub range_type: RangeType,
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
}

/// Caller-provided mapping of import files to tablet ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadPlan {
    pub entries: Vec<LoadPlanEntry>,
}

impl LoadPlan {
    pub fn table_range(
        file_name: impl Into<String>,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> LoadPlanEntry {
        LoadPlanEntry {
            file_name: file_name.into(),
            range_type: RangeType::Table,
            start: start.map(Into::into),
            end: end.map(Into::into),
        }
    }

    pub fn file_range(
        file_name: impl Into<String>,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> LoadPlanEntry {
        LoadPlanEntry {
            file_name: file_name.into(),
            range_type: RangeType::File,
            start: start.map(Into::into),
            end: end.map(Into::into),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("load plan names {0} which is not in the import directory")]
    PlanNamesMissingFile(String),
    #[error("import directory contains {0} which the load plan does not name")]
    FileNotInPlan(String),
    #[error("row {row:?} in the load plan for {file} is not a tablet boundary of table {table}")]
    NotASplit {
        table: TableId,
        file: String,
        row: String,
    },
    #[error(
        "bulk import would place {file} into {tablet_count} tablets, exceeding \
         table.bulk.max.tablets={max}"
    )]
    TooManyTablets {
        file: String,
        tablet_count: usize,
        max: usize,
    },
    #[error(
        "bulk import of {file} would bring tablet {tablet} to {would_have} files, exceeding \
         table.bulk.max.tablet.files={max}"
    )]
    TooManyTabletFiles {
        file: String,
        tablet: KeyExtent,
        would_have: usize,
        max: usize,
    },
    #[error("table {0} has no tablets")]
    NoTablets(TableId),
}

/// The computed file-to-tablet mapping of one import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMapping {
    pub tablets: Vec<(KeyExtent, Vec<StoredFile>)>,
}

/// Validates a load plan against the import directory listing and the
/// table's current tablet boundaries, and computes which files land in
/// which tablets.
pub fn compute_load_mapping(
    metadata: &MetadataStore,
    table: &TableId,
    import_dir: &str,
    files_in_dir: &[String],
    plan: &LoadPlan,
    options: &TableOptions,
) -> Result<LoadMapping, BulkError> {
    let dir_files: BTreeSet<&str> = files_in_dir.iter().map(String::as_str).collect();
    let plan_files: BTreeSet<&str> =
        plan.entries.iter().map(|e| e.file_name.as_str()).collect();
    for file in &plan_files {
        if !dir_files.contains(file) {
            return Err(BulkError::PlanNamesMissingFile(file.to_string()));
        }
    }
    for file in &dir_files {
        if !plan_files.contains(file) {
            return Err(BulkError::FileNotInPlan(file.to_string()));
        }
    }

    let tablets: Vec<KeyExtent> = metadata
        .read_tablets()
        .for_table(table.clone())
        .fetch(ColumnSet::of(&[ColumnType::PrevRow]))
        .build()
        .map(|tm| tm.extent().clone())
        .collect();
    if tablets.is_empty() {
        return Err(BulkError::NoTablets(table.clone()));
    }
    let boundaries: BTreeSet<Option<&[u8]>> =
        tablets.iter().map(|extent| extent.end_row()).collect();

    let mut mapping: BTreeMap<KeyExtent, Vec<StoredFile>> = BTreeMap::new();
    for entry in &plan.entries {
        if entry.range_type == RangeType::Table {
            for row in [&entry.start, &entry.end] {
                if let Some(row) = row {
                    if !boundaries.contains(&Some(row.as_ref())) {
                        return Err(BulkError::NotASplit {
                            table: table.clone(),
                            file: entry.file_name.clone(),
                            row: String::from_utf8_lossy(row).into_owned(),
                        });
                    }
                }
            }
        }

        let path = format!("{import_dir}/{}", entry.file_name);
        let targets: Vec<&KeyExtent> = tablets
            .iter()
            .filter(|extent| extent.overlaps(entry.start.as_deref(), entry.end.as_deref()))
            .collect();
        if targets.len() > options.bulk_max_tablets {
            return Err(BulkError::TooManyTablets {
                file: entry.file_name.clone(),
                tablet_count: targets.len(),
                max: options.bulk_max_tablets,
            });
        }
        for extent in targets {
            let file = match entry.range_type {
                RangeType::Table => StoredFile::new(path.clone()),
                RangeType::File => StoredFile::fenced(
                    path.clone(),
                    FencedRange::new(entry.start.clone(), entry.end.clone()),
                ),
            };
            mapping.entry(extent.clone()).or_default().push(file);
        }
    }

    Ok(LoadMapping {
        tablets: mapping.into_iter().collect(),
    })
}

/// The pre-flight admission check: refuses the whole import when any tablet
/// would end up over the per-tablet file cap.
pub fn check_admission(
    metadata: &MetadataStore,
    mapping: &LoadMapping,
    options: &TableOptions,
) -> Result<(), BulkError> {
    for (extent, files) in &mapping.tablets {
        let existing = metadata
            .read_tablet(extent, ColumnSet::of(&[ColumnType::Files]))
            .map(|tm| tm.files().len())
            .unwrap_or(0);
        let would_have = existing + files.len();
        if would_have > options.bulk_max_tablet_files {
            return Err(BulkError::TooManyTabletFiles {
                file: files
                    .first()
                    .map(|f| f.path.to_string())
                    .unwrap_or_default(),
                tablet: extent.clone(),
                would_have,
                max: options.bulk_max_tablet_files,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::TabletAvailability;

    fn setup() -> (MetadataStore, TableId) {
        let store = MetadataStore::new();
        let table = TableId::new("1a");
        store.bootstrap_table(
            &table,
            &[Bytes::from_static(b"g"), Bytes::from_static(b"p")],
            TabletAvailability::OnDemand,
        );
        (store, table)
    }

    fn plan_for_all(files: &[&str]) -> LoadPlan {
        LoadPlan {
            entries: files
                .iter()
                .map(|f| LoadPlan::table_range(*f, None::<Bytes>, None::<Bytes>))
                .collect(),
        }
    }

    #[test]
    fn plan_and_directory_must_agree() {
        let (store, table) = setup();
        let options = TableOptions::default();

        let err = compute_load_mapping(
            &store,
            &table,
            "/bulk/one",
            &["a.rf".to_string()],
            &plan_for_all(&["a.rf", "b.rf"]),
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, BulkError::PlanNamesMissingFile(f) if f == "b.rf"));

        let err = compute_load_mapping(
            &store,
            &table,
            "/bulk/one",
            &["a.rf".to_string(), "stray.rf".to_string()],
            &plan_for_all(&["a.rf"]),
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, BulkError::FileNotInPlan(f) if f == "stray.rf"));
    }

    #[test]
    fn table_ranges_must_hit_existing_splits() {
        let (store, table) = setup();
        let options = TableOptions::default();
        let plan = LoadPlan {
            entries: vec![LoadPlan::table_range(
                "a.rf",
                Some(Bytes::from_static(b"g")),
                Some(Bytes::from_static(b"x")),
            )],
        };
        let err = compute_load_mapping(
            &store,
            &table,
            "/bulk/one",
            &["a.rf".to_string()],
            &plan,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, BulkError::NotASplit { row, .. } if row == "x"));
    }

    #[test]
    fn file_ranges_are_fenced_and_mapped_by_overlap() {
        let (store, table) = setup();
        let options = TableOptions::default();
        let plan = LoadPlan {
            entries: vec![LoadPlan::file_range(
                "a.rf",
                Some(Bytes::from_static(b"b")),
                Some(Bytes::from_static(b"h")),
            )],
        };
        let mapping = compute_load_mapping(
            &store,
            &table,
            "/bulk/one",
            &["a.rf".to_string()],
            &plan,
            &options,
        )
        .unwrap();
        // (b, h] overlaps the first two tablets, not the third
        assert_eq!(mapping.tablets.len(), 2);
        for (_, files) in &mapping.tablets {
            assert!(!files[0].fenced.is_infinite());
        }
    }

    #[test]
    fn admission_refuses_over_cap_naming_both_numbers() {
        let (store, table) = setup();
        let options = TableOptions {
            bulk_max_tablet_files: 5,
            ..TableOptions::default()
        };
        let files: Vec<String> = (0..6).map(|i| format!("f{i}.rf")).collect();
        let file_refs: Vec<&str> = files.iter().map(String::as_str).collect();
        // all six files into the first tablet only
        let plan = LoadPlan {
            entries: file_refs
                .iter()
                .map(|f| {
                    LoadPlan::file_range(*f, None::<Bytes>, Some(Bytes::from_static(b"a")))
                })
                .collect(),
        };
        let mapping =
            compute_load_mapping(&store, &table, "/bulk/one", &files, &plan, &options)
                .unwrap();
        let err = check_admission(&store, &mapping, &options).unwrap_err();
        let message = err.to_string();
        assert!(message.contains('5'), "{message}");
        assert!(message.contains('6'), "{message}");
        assert!(message.contains("table.bulk.max.tablet.files"), "{message}");
    }

    #[test]
    fn per_file_tablet_cap_is_enforced() {
        let (store, table) = setup();
        let options = TableOptions {
            bulk_max_tablets: 2,
            ..TableOptions::default()
        };
        let plan = plan_for_all(&["wide.rf"]);
        let err = compute_load_mapping(
            &store,
            &table,
            "/bulk/one",
            &["wide.rf".to_string()],
            &plan,
            &options,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BulkError::TooManyTablets {
                tablet_count: 3,
                max: 2,
                ..
            }
        ));
    }
}
