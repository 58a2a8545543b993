#![allow(dead_code)]

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use linkage_harness::{Comparison, ComparisonLevel, InputTable, LinkType, Linker, Record, Settings};

const FIRST_NAMES: &[&str] = &[
    "amelia", "oliver", "isla", "george", "ava", "harry", "mia", "jack", "ivy", "noah", "lily", "leo",
    "grace", "oscar", "freya", "arthur", "sophie", "charlie", "emily", "thomas",
];

const SURNAMES: &[&str] = &[
    "smith", "jones", "taylor", "brown", "williams", "wilson", "johnson", "davies", "patel", "wright",
    "robinson", "thompson", "evans", "walker", "white", "roberts", "green", "hall", "thomas", "clarke",
    "jackson", "wood", "harris", "edwards", "turner", "martin", "cooper", "hill", "ward", "hughes",
];

const CITIES: &[&str] = &["london", "leeds", "bristol", "york", "bath", "derby", "hull", "exeter"];

/// Synthetic people: each entity appears 1 to 4 times, with occasional typos
/// in the first name and missing cities on the copies.
pub fn people(entities: usize, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::new();
    let mut next_id = 0u64;
    for cluster in 0..entities {
        let first_name = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
        let surname = SURNAMES[rng.gen_range(0..SURNAMES.len())];
        let city = CITIES[rng.gen_range(0..CITIES.len())];
        let dob = format!(
            "{:04}-{:02}-{:02}",
            rng.gen_range(1940..2000),
            rng.gen_range(1..=12),
            rng.gen_range(1..=28)
        );
        let copies = rng.gen_range(1..=4);
        for copy in 0..copies {
            let first = if copy > 0 && rng.gen_bool(0.2) {
                swap_adjacent(first_name, &mut rng)
            } else {
                first_name.to_string()
            };
            let city_value = if copy > 0 && rng.gen_bool(0.1) {
                Value::Null
            } else {
                json!(city)
            };
            records.push(record(json!({
                "unique_id": next_id,
                "first_name": first,
                "surname": surname,
                "dob": dob,
                "city": city_value,
                "cluster": cluster,
            })));
            next_id += 1;
        }
    }
    records
}

fn swap_adjacent(name: &str, rng: &mut StdRng) -> String {
    let mut chars: Vec<char> = name.chars().collect();
    let i = rng.gen_range(0..chars.len() - 1);
    chars.swap(i, i + 1);
    chars.into_iter().collect()
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Even ids to the left dataset, odd to the right.
pub fn split(records: &[Record]) -> (Vec<Record>, Vec<Record>) {
    records
        .iter()
        .cloned()
        .partition(|r| r["unique_id"].as_u64().unwrap() % 2 == 0)
}

pub fn comparisons() -> Vec<Comparison> {
    vec![
        Comparison::levenshtein_at_thresholds("first_name", &[2]),
        Comparison::exact_match("surname"),
        Comparison::exact_match("dob"),
        Comparison::exact_match("city"),
    ]
}

pub fn settings(link_type: LinkType) -> Settings {
    Settings::new(link_type, comparisons())
        .unwrap()
        .with_seed(1234)
        .with_blocking_rules_to_generate_predictions(["l.first_name = r.first_name", "l.surname = r.surname"])
}

pub async fn dedupe_linker() -> (Linker, Vec<Record>) {
    let records = people(400, 42);
    let linker = Linker::with_sqlite(
        vec![InputTable::new("people", records.clone())],
        settings(LinkType::DedupeOnly),
    )
    .await
    .unwrap();
    (linker, records)
}

pub async fn link_only_linker() -> (Linker, Vec<Record>, Vec<Record>) {
    let (left, right) = split(&people(400, 42));
    let linker = Linker::with_sqlite(
        vec![
            InputTable::new("left", left.clone()),
            InputTable::new("right", right.clone()),
        ],
        settings(LinkType::LinkOnly),
    )
    .await
    .unwrap();
    (linker, left, right)
}

pub async fn link_and_dedupe_linker() -> (Linker, Vec<Record>, Vec<Record>) {
    let (left, right) = split(&people(300, 17));
    let linker = Linker::with_sqlite(
        vec![
            InputTable::new("left", left.clone()),
            InputTable::new("right", right.clone()),
        ],
        settings(LinkType::LinkAndDedupe),
    )
    .await
    .unwrap();
    (linker, left, right)
}

/// Non-null value counts of one column.
pub fn value_counts(records: &[Record], column: &str) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for r in records {
        if let Some(v) = r.get(column).and_then(Value::as_str) {
            *counts.entry(v.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Unordered pairs of distinct records satisfying `pred`.
pub fn brute_force_pairs(records: &[Record], pred: impl Fn(&Record, &Record) -> bool) -> u64 {
    let mut n = 0;
    for (i, l) in records.iter().enumerate() {
        for r in &records[i + 1..] {
            if pred(l, r) {
                n += 1;
            }
        }
    }
    n
}

pub fn same(l: &Record, r: &Record, column: &str) -> bool {
    match (l.get(column), r.get(column)) {
        (Some(a), Some(b)) => !a.is_null() && a == b,
        _ => false,
    }
}

/// A comparison with a level no pair can reach.
pub fn comparison_with_unreachable_level() -> Comparison {
    Comparison::new(
        "first_name_marker",
        vec![
            ComparisonLevel::null_level("first_name"),
            ComparisonLevel::custom("first_name_l = 'no such name' AND first_name_r = 'no such name'", "Marker"),
            ComparisonLevel::else_level(),
        ],
    )
}
