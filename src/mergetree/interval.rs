//! Interval partitioning of data files into sections of sorted runs.
//!
//! Files are grouped by key-range interval containment: a *section* is a
//! maximal set of files whose ranges transitively overlap. Sections never
//! share keys, so each one can be merged independently. Within a section,
//! files pack into sorted runs first-fit: a file joins the earliest run whose
//! current max key is strictly below the file's min key.

use std::cmp::Ordering;

use crate::{
    mergetree::SortedRun,
    ondisk::meta::DataFileMeta,
    record::RowComparator,
};

/// Deterministic planner from a file list to ordered sections.
pub struct IntervalPartition {
    files: Vec<DataFileMeta>,
    comparator: RowComparator,
}

impl IntervalPartition {
    /// Sort `files` by (min key, max key) and prepare the sweep.
    pub fn new(mut files: Vec<DataFileMeta>, comparator: RowComparator) -> Self {
        files.sort_by(|a, b| {
            comparator(&a.min_key, &b.min_key)
                .then_with(|| comparator(&a.max_key, &b.max_key))
        });
        IntervalPartition { files, comparator }
    }

    /// Produce sections in key order; each section is a list of sorted runs.
    /// A single-run section is non-overlapping and admits value-predicate
    /// pushdown; a multi-run section restricts pushdown to key predicates.
    pub fn partition(self) -> Vec<Vec<SortedRun>> {
        let IntervalPartition { files, comparator } = self;
        let mut sections = Vec::new();
        let mut section: Vec<DataFileMeta> = Vec::new();
        let mut high = None;

        for file in files {
            match &high {
                Some(open_max) if comparator(&file.min_key, open_max) != Ordering::Greater => {
                    // Still inside the open interval; extend it if needed.
                    if comparator(&file.max_key, open_max) == Ordering::Greater {
                        high = Some(file.max_key.clone());
                    }
                }
                Some(_) => {
                    sections.push(Self::pack_runs(std::mem::take(&mut section), &comparator));
                    high = Some(file.max_key.clone());
                }
                None => high = Some(file.max_key.clone()),
            }
            section.push(file);
        }
        if !section.is_empty() {
            sections.push(Self::pack_runs(section, &comparator));
        }
        sections
    }

    fn pack_runs(section: Vec<DataFileMeta>, comparator: &RowComparator) -> Vec<SortedRun> {
        let mut runs: Vec<Vec<DataFileMeta>> = Vec::new();
        'next_file: for file in section {
            for run in runs.iter_mut() {
                let last_max = &run.last().expect("runs are never empty").max_key;
                if comparator(last_max, &file.min_key) == Ordering::Less {
                    run.push(file);
                    continue 'next_file;
                }
            }
            runs.push(vec![file]);
        }
        runs.into_iter()
            .map(|files| SortedRun::from_sorted(files, comparator))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mergetree::tests::file,
        record::default_key_comparator,
    };

    fn names(run: &SortedRun) -> Vec<&str> {
        run.files().iter().map(|f| f.file_name.as_str()).collect()
    }

    #[test]
    fn disjoint_files_form_singleton_sections() {
        let sections = IntervalPartition::new(
            vec![file("f1", "a", "b"), file("f2", "c", "d"), file("f3", "e", "f")],
            default_key_comparator(),
        )
        .partition();
        assert_eq!(sections.len(), 3);
        assert!(sections.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn overlap_chains_into_one_section() {
        // f1 [a, d] overlaps f2 [c, f]; f2 overlaps f3 [f, g]; all connect.
        let sections = IntervalPartition::new(
            vec![file("f1", "a", "d"), file("f2", "c", "f"), file("f3", "f", "g")],
            default_key_comparator(),
        )
        .partition();
        assert_eq!(sections.len(), 1);
        assert!(sections[0].len() >= 2);
    }

    #[test]
    fn touching_boundaries_overlap() {
        // max == next min counts as overlap: both files can hold that key.
        let sections = IntervalPartition::new(
            vec![file("f1", "a", "c"), file("f2", "c", "e")],
            default_key_comparator(),
        )
        .partition();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].len(), 2);
    }

    #[test]
    fn first_fit_packs_earliest_run() {
        // f1 [a, b], f2 [a, c], f3 [d, e]: f3 fits after f1 in run 0.
        let sections = IntervalPartition::new(
            vec![file("f1", "a", "b"), file("f2", "a", "c"), file("f3", "d", "e")],
            default_key_comparator(),
        )
        .partition();
        // f2 keeps the section open through "c" < "d"? No: f3.min "d" > "c",
        // so the section closes before f3.
        assert_eq!(sections.len(), 2);
        let first = &sections[0];
        assert_eq!(first.len(), 2);
        assert_eq!(names(&first[0]), vec!["f1"]);
        assert_eq!(names(&first[1]), vec!["f2"]);
    }

    #[test]
    fn first_fit_within_one_section() {
        // Interlocking ranges keep one section; packing is first-fit.
        let sections = IntervalPartition::new(
            vec![
                file("f1", "a", "c"),
                file("f2", "b", "d"),
                file("f3", "d", "g"),
                file("f4", "e", "h"),
            ],
            default_key_comparator(),
        )
        .partition();
        assert_eq!(sections.len(), 1);
        let runs = &sections[0];
        assert_eq!(runs.len(), 2);
        assert_eq!(names(&runs[0]), vec!["f1", "f3"]);
        assert_eq!(names(&runs[1]), vec!["f2", "f4"]);
    }

    #[test]
    fn deterministic_under_input_order() {
        let a = IntervalPartition::new(
            vec![file("f2", "b", "d"), file("f1", "a", "c"), file("f3", "e", "f")],
            default_key_comparator(),
        )
        .partition();
        let b = IntervalPartition::new(
            vec![file("f3", "e", "f"), file("f1", "a", "c"), file("f2", "b", "d")],
            default_key_comparator(),
        )
        .partition();
        let flatten = |sections: Vec<Vec<SortedRun>>| {
            sections
                .into_iter()
                .map(|runs| {
                    runs.iter()
                        .map(|r| names(r).join(","))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(flatten(a), flatten(b));
    }

    #[test]
    fn empty_input_yields_no_sections() {
        let sections =
            IntervalPartition::new(vec![], default_key_comparator()).partition();
        assert!(sections.is_empty());
    }
}
