//! Sequence grouping: clustering numbered runs of image names
//!
//! A run like `ale 1.jpg … ale 7.jpg` shares a textual prefix up to a
//! trailing decimal index. Runs at least [`SEQUENCE_THRESHOLD`] long are
//! coalesced into one AVIS sequence; everything else is encoded as scatter
//! AVIF.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Minimum run length for a group to become an AVIS sequence.
pub const SEQUENCE_THRESHOLD: usize = 5;

// Non-greedy prefix, one or more decimal digits, one extension.
fn run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.*?)(\d+)(\.[^.]+)$").expect("valid pattern"))
}

/// Clusters image names into numbered runs.
///
/// Returns `(groups, ungrouped)`. Groups are keyed by `prefix + extension`
/// (so runs never merge across file types) with members ordered by their
/// numeric index, ties broken by name. Every input name appears exactly once
/// across the two outputs.
pub fn group_by_prefix(
    names: &[String],
    threshold: usize,
) -> (BTreeMap<String, Vec<String>>, Vec<String>) {
    let mut buckets: BTreeMap<String, Vec<(u64, String)>> = BTreeMap::new();
    let mut ungrouped = Vec::new();

    for name in names {
        match run_pattern().captures(name) {
            Some(caps) => match caps[2].parse::<u64>() {
                Ok(index) => {
                    let key = format!("{}{}", &caps[1], &caps[3]);
                    buckets.entry(key).or_default().push((index, name.clone()));
                }
                Err(_) => ungrouped.push(name.clone()),
            },
            None => ungrouped.push(name.clone()),
        }
    }

    let mut groups = BTreeMap::new();
    for (key, mut members) in buckets {
        members.sort();
        if members.len() >= threshold {
            groups.insert(key, members.into_iter().map(|(_, name)| name).collect());
        } else {
            ungrouped.extend(members.into_iter().map(|(_, name)| name));
        }
    }

    (groups, ungrouped)
}

/// Derives the scatter-AVIF target name: the final suffix becomes `.avif`,
/// or `.avif` is appended when there is none.
pub fn avif_target_name(name: &str) -> String {
    let file_start = name.rfind('/').map_or(0, |p| p + 1);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => format!("{}.avif", &name[..file_start + dot]),
        _ => format!("{name}.avif"),
    }
}

/// Derives the AVIS target name for a group key, under the `sequences/`
/// namespace. Group keys are unique, so targets are collision-free.
pub fn avis_target_name(group_key: &str) -> String {
    format!("sequences/{group_key}.avis")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_basic_grouping() {
        let input = names(&[
            "images/01/ale 1.jpg",
            "images/01/ale 2.jpg",
            "images/01/ale 3.jpg",
            "images/01/ale 4.jpg",
            "images/01/ale 5.jpg",
        ]);
        let (groups, ungrouped) = group_by_prefix(&input, SEQUENCE_THRESHOLD);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["images/01/ale .jpg"], input);
        assert!(ungrouped.is_empty());
    }

    #[test]
    fn test_small_group_goes_to_ungrouped() {
        let input = names(&[
            "images/01/ale 1.jpg",
            "images/01/ale 2.jpg",
            "images/01/ale 3.jpg",
        ]);
        let (groups, ungrouped) = group_by_prefix(&input, SEQUENCE_THRESHOLD);
        assert!(groups.is_empty());
        assert_eq!(ungrouped.len(), 3);
    }

    #[test]
    fn test_mixed_groups() {
        let input = names(&[
            "images/01/ale 1.jpg",
            "images/01/ale 2.jpg",
            "images/01/ale 3.jpg",
            "images/01/ale 4.jpg",
            "images/01/ale 5.jpg",
            "images/01/dun 1.jpg",
            "images/01/dun 2.jpg",
            "images/01/solo.jpg",
        ]);
        let (groups, ungrouped) = group_by_prefix(&input, SEQUENCE_THRESHOLD);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["images/01/ale .jpg"].len(), 5);
        assert_eq!(ungrouped.len(), 3);
    }

    #[test]
    fn test_sorted_by_numeric_index() {
        let input = names(&[
            "img/x10.png",
            "img/x2.png",
            "img/x1.png",
            "img/x5.png",
            "img/x3.png",
        ]);
        let (groups, _) = group_by_prefix(&input, SEQUENCE_THRESHOLD);
        assert_eq!(
            groups["img/x.png"],
            names(&["img/x1.png", "img/x2.png", "img/x3.png", "img/x5.png", "img/x10.png"])
        );
    }

    #[test]
    fn test_no_number_suffix() {
        let input = names(&["images/logo.png", "images/bg.jpg"]);
        let (groups, ungrouped) = group_by_prefix(&input, SEQUENCE_THRESHOLD);
        assert!(groups.is_empty());
        assert_eq!(ungrouped, input);
    }

    #[test]
    fn test_empty_input() {
        let (groups, ungrouped) = group_by_prefix(&[], SEQUENCE_THRESHOLD);
        assert!(groups.is_empty());
        assert!(ungrouped.is_empty());
    }

    #[test]
    fn test_threshold_boundary() {
        let four: Vec<String> = (1..=4).map(|i| format!("a {i}.png")).collect();
        let (groups, ungrouped) = group_by_prefix(&four, 5);
        assert!(groups.is_empty());
        assert_eq!(ungrouped.len(), 4);

        let five: Vec<String> = (1..=5).map(|i| format!("a {i}.png")).collect();
        let (groups, ungrouped) = group_by_prefix(&five, 5);
        assert_eq!(groups.len(), 1);
        assert!(ungrouped.is_empty());
    }

    #[test]
    fn test_runs_do_not_merge_across_extensions() {
        let mut input: Vec<String> = (1..=3).map(|i| format!("b {i}.png")).collect();
        input.extend((1..=3).map(|i| format!("b {i}.jpg")));
        let (groups, ungrouped) = group_by_prefix(&input, 5);
        // 3 + 3 never forms a 6-member group
        assert!(groups.is_empty());
        assert_eq!(ungrouped.len(), 6);
    }

    #[test]
    fn test_every_name_appears_exactly_once() {
        let input = names(&[
            "a 1.png", "a 2.png", "a 3.png", "a 4.png", "a 5.png",
            "b 1.png", "c.png", "d 12.jpg",
        ]);
        let (groups, ungrouped) = group_by_prefix(&input, 5);
        let mut all: Vec<String> = groups.values().flatten().cloned().collect();
        all.extend(ungrouped);
        all.sort();
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_target_names() {
        assert_eq!(avif_target_name("images/01/ale 1.jpg"), "images/01/ale 1.avif");
        assert_eq!(avif_target_name("images/a.b/frame.PNG"), "images/a.b/frame.avif");
        assert_eq!(avif_target_name("images/noext"), "images/noext.avif");
        assert_eq!(
            avis_target_name("images/01/ale .jpg"),
            "sequences/images/01/ale .jpg.avis"
        );
    }
}
