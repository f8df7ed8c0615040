//! Structural comparison of intended and observed boot-information records.
//!
//! Equality is exact: objects compare by key set and values, arrays by length,
//! order and elements, scalars by value. On a mismatch both full records are
//! kept alongside a list of the individual differences so the report can be
//! read without rerunning the scenario.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::extract::kind_name;
use crate::record::BootRecord;

/// Result of comparing two records.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Equal,
    Mismatch(Box<Mismatch>),
}

impl Comparison {
    pub fn is_equal(&self) -> bool {
        matches!(self, Comparison::Equal)
    }
}

/// Both records plus every place they differ.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub intended: Value,
    pub observed: Value,
    pub differences: Vec<Difference>,
}

/// A single difference, located by a JSON path such as `$.modules[1].cmdline`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub path: String,
    pub kind: DifferenceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DifferenceKind {
    /// Key present before the handoff, absent after it.
    MissingInObserved { intended: Value },
    /// Key absent before the handoff, present after it.
    UnexpectedInObserved { observed: Value },
    /// Arrays hold the same elements in a different order.
    OrderMismatch,
    LengthMismatch { intended: usize, observed: usize },
    ValueMismatch { intended: Value, observed: Value },
}

/// Compare two decoded records.
pub fn compare(intended: &BootRecord, observed: &BootRecord) -> Comparison {
    compare_values(intended.as_value(), observed.as_value())
}

/// Compare two typed records through their JSON form.
pub fn compare_typed<R: Serialize>(intended: &R, observed: &R) -> serde_json::Result<Comparison> {
    Ok(compare_values(
        &serde_json::to_value(intended)?,
        &serde_json::to_value(observed)?,
    ))
}

pub fn compare_values(intended: &Value, observed: &Value) -> Comparison {
    if intended == observed {
        return Comparison::Equal;
    }

    let mut differences = Vec::new();
    diff(&mut String::from("$"), intended, observed, &mut differences);

    Comparison::Mismatch(Box::new(Mismatch {
        intended: intended.clone(),
        observed: observed.clone(),
        differences,
    }))
}

fn diff(path: &mut String, intended: &Value, observed: &Value, out: &mut Vec<Difference>) {
    if intended == observed {
        return;
    }

    match (intended, observed) {
        (Value::Object(want), Value::Object(got)) => {
            for (key, want_value) in want {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                match got.get(key) {
                    Some(got_value) => diff(path, want_value, got_value, out),
                    None => out.push(Difference {
                        path: path.clone(),
                        kind: DifferenceKind::MissingInObserved {
                            intended: want_value.clone(),
                        },
                    }),
                }
                path.truncate(len);
            }
            for (key, got_value) in got.iter().filter(|(key, _)| !want.contains_key(*key)) {
                out.push(Difference {
                    path: format!("{path}.{key}"),
                    kind: DifferenceKind::UnexpectedInObserved {
                        observed: got_value.clone(),
                    },
                });
            }
        }
        (Value::Array(want), Value::Array(got)) => {
            if want.len() != got.len() {
                out.push(Difference {
                    path: path.clone(),
                    kind: DifferenceKind::LengthMismatch {
                        intended: want.len(),
                        observed: got.len(),
                    },
                });
            } else if is_permutation(want, got) {
                out.push(Difference {
                    path: path.clone(),
                    kind: DifferenceKind::OrderMismatch,
                });
            }
            for (i, (want_item, got_item)) in want.iter().zip(got).enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                diff(path, want_item, got_item, out);
                path.truncate(len);
            }
        }
        _ => out.push(Difference {
            path: path.clone(),
            kind: DifferenceKind::ValueMismatch {
                intended: intended.clone(),
                observed: observed.clone(),
            },
        }),
    }
}

// Values are neither Hash nor Ord, so match greedily.
fn is_permutation(want: &[Value], got: &[Value]) -> bool {
    let mut used = vec![false; got.len()];
    want.iter().all(|item| {
        match got
            .iter()
            .enumerate()
            .position(|(i, candidate)| !used[i] && candidate == item)
        {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DifferenceKind::MissingInObserved { intended } => {
                write!(f, "{}: missing after handoff (intended {})", self.path, intended)
            }
            DifferenceKind::UnexpectedInObserved { observed } => {
                write!(f, "{}: unexpected after handoff (observed {})", self.path, observed)
            }
            DifferenceKind::OrderMismatch => {
                write!(f, "{}: same elements in a different order", self.path)
            }
            DifferenceKind::LengthMismatch { intended, observed } => write!(
                f,
                "{}: intended {} elements, observed {}",
                self.path, intended, observed
            ),
            DifferenceKind::ValueMismatch { intended, observed }
                if kind_name(intended) != kind_name(observed) =>
            {
                write!(
                    f,
                    "{}: intended {} {}, observed {} {}",
                    self.path,
                    kind_name(intended),
                    intended,
                    kind_name(observed),
                    observed
                )
            }
            DifferenceKind::ValueMismatch { intended, observed } => {
                write!(f, "{}: intended {}, observed {}", self.path, intended, observed)
            }
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "boot information changed across the handoff")?;
        writeln!(f, "differences:")?;
        for difference in &self.differences {
            writeln!(f, "  - {difference}")?;
        }
        writeln!(f, "intended:")?;
        writeln!(f, "{}", pretty(&self.intended))?;
        writeln!(f, "observed:")?;
        write!(f, "{}", pretty(&self.observed))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Description, Module};
    use serde_json::json;

    fn mismatch(intended: Value, observed: Value) -> Mismatch {
        match compare_values(&intended, &observed) {
            Comparison::Mismatch(m) => *m,
            Comparison::Equal => panic!("expected a mismatch"),
        }
    }

    #[test]
    fn object_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        assert!(compare_values(&a, &b).is_equal());
    }

    #[test]
    fn numbers_compare_exactly() {
        let m = mismatch(json!({"end": 4096}), json!({"end": 4096.0}));
        assert_eq!(m.differences.len(), 1);
        assert_eq!(m.differences[0].path, "$.end");
    }

    #[test]
    fn missing_and_unexpected_keys() {
        let m = mismatch(json!({"a": 1, "b": 2}), json!({"a": 1, "c": 3}));
        assert_eq!(
            m.differences,
            vec![
                Difference {
                    path: "$.b".into(),
                    kind: DifferenceKind::MissingInObserved { intended: json!(2) },
                },
                Difference {
                    path: "$.c".into(),
                    kind: DifferenceKind::UnexpectedInObserved { observed: json!(3) },
                },
            ]
        );
    }

    #[test]
    fn reordered_array_is_flagged() {
        let m = mismatch(json!({"modules": ["a", "b"]}), json!({"modules": ["b", "a"]}));
        assert_eq!(m.differences[0].path, "$.modules");
        assert_eq!(m.differences[0].kind, DifferenceKind::OrderMismatch);
        assert_eq!(m.differences[1].path, "$.modules[0]");
        assert_eq!(m.differences[2].path, "$.modules[1]");
    }

    #[test]
    fn duplicate_elements_are_not_a_permutation() {
        assert!(!is_permutation(&[json!(1), json!(1)], &[json!(1), json!(2)]));
        assert!(is_permutation(&[json!(1), json!(2), json!(1)], &[json!(1), json!(1), json!(2)]));
    }

    #[test]
    fn length_mismatch_still_reports_common_prefix() {
        let m = mismatch(json!([1, 2, 3]), json!([1, 5]));
        assert_eq!(
            m.differences[0].kind,
            DifferenceKind::LengthMismatch { intended: 3, observed: 2 }
        );
        assert_eq!(m.differences[1].path, "$[1]");
        assert_eq!(m.differences.len(), 2);
    }

    #[test]
    fn type_change_is_a_value_mismatch() {
        let m = mismatch(json!({"flags": 3}), json!({"flags": "3"}));
        assert!(m.differences[0].to_string().contains("a number"));
        assert!(m.differences[0].to_string().contains("a string"));
    }

    #[test]
    fn display_contains_both_records() {
        let m = mismatch(
            json!({"modules": [{"cmdline": "foo=bar"}]}),
            json!({"modules": [{"cmdline": "foo=baz"}]}),
        );
        let text = m.to_string();
        assert!(text.contains("$.modules[0].cmdline: intended \"foo=bar\", observed \"foo=baz\""));
        assert!(text.contains("intended:\n{"));
        assert!(text.contains("observed:\n{"));
        assert!(text.contains("foo=bar") && text.contains("foo=baz"));
    }

    #[test]
    fn typed_records_compare_through_json() {
        let a = Description {
            modules: vec![Module {
                name: "/kernel".into(),
                cmdline: "foo=bar".into(),
                ..Module::default()
            }],
            ..Description::default()
        };
        let mut b = a.clone();
        assert!(compare_typed(&a, &b).unwrap().is_equal());

        b.modules[0].end = 0x1000;
        match compare_typed(&a, &b).unwrap() {
            Comparison::Mismatch(m) => assert_eq!(m.differences[0].path, "$.modules[0].end"),
            Comparison::Equal => panic!("expected a mismatch"),
        }
    }
}
