//! Tabular views over cached records.
//!
//! A [`ResourceView`] is nothing more than a list of columns, each a header
//! plus a JSON pointer into the object. Kinds without a dedicated view get
//! [`ResourceView::generic`].

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::resource::{ResourceKind, ResourceRecord};

/// Shown for fields that are absent or null.
const MISSING: &str = "<none>";

/// Shown for timestamps that do not parse.
const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFormat {
    /// The field as-is, strings without quotes.
    Text,
    /// An RFC 3339 timestamp shown as time elapsed since, e.g. `3h`.
    Age,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub header: String,
    /// RFC 6901 pointer, e.g. `/status/phase`.
    pub pointer: String,
    pub format: CellFormat,
}

impl Column {
    pub fn new(header: impl Into<String>, pointer: impl Into<String>) -> Self {
        Column {
            header: header.into(),
            pointer: pointer.into(),
            format: CellFormat::Text,
        }
    }

    pub fn age(header: impl Into<String>, pointer: impl Into<String>) -> Self {
        Column {
            format: CellFormat::Age,
            ..Column::new(header, pointer)
        }
    }

    pub fn extract(&self, payload: &Value) -> String {
        self.extract_at(payload, Utc::now())
    }

    /// Like [`Column::extract`], with ages measured up to `now`.
    pub fn extract_at(&self, payload: &Value, now: DateTime<Utc>) -> String {
        let value = match payload.pointer(&self.pointer) {
            None | Some(Value::Null) => return MISSING.to_string(),
            Some(value) => value,
        };

        match (self.format, value) {
            (CellFormat::Text, Value::String(text)) => text.clone(),
            (CellFormat::Text, other) => other.to_string(),
            (CellFormat::Age, Value::String(stamp)) => match DateTime::parse_from_rfc3339(stamp) {
                Ok(created) => format_age(now.signed_duration_since(created.with_timezone(&Utc))),
                Err(_) => UNKNOWN.to_string(),
            },
            (CellFormat::Age, _) => UNKNOWN.to_string(),
        }
    }
}

/// The most significant unit of `age`, truncated: `2y`, `1mo`, `5d`, `3h`, `12m`, `40s`.
fn format_age(age: Duration) -> String {
    let days = age.num_days();
    if days > 365 {
        format!("{}y", days / 365)
    } else if days > 30 {
        format!("{}mo", days / 30)
    } else if days > 0 {
        format!("{days}d")
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m", age.num_minutes())
    } else {
        // Clock skew can put a fresh object slightly in the future.
        format!("{}s", age.num_seconds().max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceView {
    pub kind: String,
    pub columns: Vec<Column>,
}

impl ResourceView {
    /// The built-in view for `kind`, falling back to [`ResourceView::generic`].
    pub fn for_kind(kind: &ResourceKind) -> Self {
        let name = Column::new("NAME", "/metadata/name");
        let namespace = Column::new("NAMESPACE", "/metadata/namespace");
        let age = Column::age("AGE", "/metadata/creationTimestamp");

        let columns = match (kind.group.as_str(), kind.kind.as_str()) {
            ("", "Pod") => vec![
                name,
                namespace,
                Column::new("STATUS", "/status/phase"),
                Column::new("NODE", "/spec/nodeName"),
                Column::new("IP", "/status/podIP"),
                age,
            ],
            ("apps", "Deployment") => vec![
                name,
                namespace,
                Column::new("REPLICAS", "/spec/replicas"),
                Column::new("READY", "/status/readyReplicas"),
                Column::new("AVAILABLE", "/status/availableReplicas"),
                age,
            ],
            ("", "Service") => vec![
                name,
                namespace,
                Column::new("TYPE", "/spec/type"),
                Column::new("CLUSTER-IP", "/spec/clusterIP"),
                age,
            ],
            ("", "Node") => vec![
                name,
                Column::new("VERSION", "/status/nodeInfo/kubeletVersion"),
                Column::new("OS-IMAGE", "/status/nodeInfo/osImage"),
                age,
            ],
            ("", "ConfigMap") => vec![name, namespace, age],
            _ => return Self::generic(kind),
        };

        ResourceView {
            kind: kind.to_string(),
            columns,
        }
    }

    pub fn generic(kind: &ResourceKind) -> Self {
        let mut columns = vec![Column::new("NAME", "/metadata/name")];
        if kind.namespaced {
            columns.push(Column::new("NAMESPACE", "/metadata/namespace"));
        }
        columns.push(Column::age("AGE", "/metadata/creationTimestamp"));

        ResourceView {
            kind: kind.to_string(),
            columns,
        }
    }

    pub fn headers(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.header.as_str()).collect()
    }

    pub fn row(&self, record: &ResourceRecord) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| column.extract(&record.payload))
            .collect()
    }

    pub fn rows(&self, records: &[ResourceRecord]) -> Vec<Vec<String>> {
        records.iter().map(|record| self.row(record)).collect()
    }

    /// Render `records` as a plain-text table with left-aligned columns.
    ///
    /// Widths count characters, so names such as `müller` line up.
    pub fn render(&self, records: &[ResourceRecord]) -> String {
        let rows = self.rows(records);

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                rows.iter()
                    .map(|row| row[index].chars().count())
                    .chain(std::iter::once(column.header.chars().count()))
                    .max()
                    .unwrap_or_default()
            })
            .collect();

        let format_line = |cells: Vec<&str>| {
            let line = cells
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            line.trim_end().to_string()
        };

        std::iter::once(format_line(self.headers()))
            .chain(
                rows.iter()
                    .map(|row| format_line(row.iter().map(String::as_str).collect())),
            )
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Records matching every term of `query` in at least one column.
    ///
    /// Matching is case-insensitive and `"double quoted"` phrases count as a
    /// single term. An empty query matches everything. Input order is kept.
    pub fn search(&self, records: &[ResourceRecord], query: &str) -> Vec<ResourceRecord> {
        let terms = search_terms(query);

        records
            .iter()
            .filter(|record| {
                let cells: Vec<String> = self
                    .row(record)
                    .into_iter()
                    .map(|cell| cell.to_lowercase())
                    .collect();
                terms
                    .iter()
                    .all(|term| cells.iter().any(|cell| cell.contains(term.as_str())))
            })
            .cloned()
            .collect()
    }
}

fn search_terms(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in query.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            c => current.extend(c.to_lowercase()),
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }

    terms
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::resource::{RawObject, ResourceKey, ResourceVersion};

    fn pod(name: &str, namespace: &str, phase: &str, node: Option<&str>) -> ResourceRecord {
        RawObject {
            key: ResourceKey::new("Pod", namespace, name),
            resource_version: ResourceVersion(1),
            payload: json!({
                "metadata": { "name": name, "namespace": namespace },
                "spec": { "nodeName": node },
                "status": { "phase": phase, "podIP": "10.0.0.12" },
            }),
        }
        .into_record()
    }

    fn pods() -> Vec<ResourceRecord> {
        vec![
            pod("api-7d9f", "backend", "Running", Some("worker-1")),
            pod("db-0", "backend", "Pending", None),
            pod("frontend", "web", "Running", Some("worker-2")),
        ]
    }

    #[test]
    fn pods_render_as_aligned_table() {
        let view = ResourceView::for_kind(&"Pod".parse().unwrap());

        assert_eq!(
            view.render(&pods()),
            indoc! {"
                NAME      NAMESPACE  STATUS   NODE      IP         AGE
                api-7d9f  backend    Running  worker-1  10.0.0.12  <none>
                db-0      backend    Pending  <none>    10.0.0.12  <none>
                frontend  web        Running  worker-2  10.0.0.12  <none>"}
        );
    }

    #[test]
    fn widths_count_characters_not_bytes() {
        let view = ResourceView {
            kind: "Pod".to_string(),
            columns: vec![
                Column::new("NAME", "/metadata/name"),
                Column::new("PHASE", "/status/phase"),
            ],
        };

        assert_eq!(
            view.render(&[
                pod("müller", "default", "Running", None),
                pod("db", "default", "Pending", None),
            ]),
            indoc! {"
                NAME    PHASE
                müller  Running
                db      Pending"}
        );
    }

    #[test]
    fn unknown_kinds_get_generic_columns() {
        let namespaced = ResourceView::for_kind(&"example.com/v1/Widget".parse().unwrap());
        assert_eq!(namespaced.headers(), vec!["NAME", "NAMESPACE", "AGE"]);

        let cluster_scoped = ResourceView::generic(&"StorageClass".parse().unwrap());
        assert_eq!(cluster_scoped.headers(), vec!["NAME", "AGE"]);
    }

    #[test]
    fn ages_show_the_largest_unit() {
        assert_eq!(format_age(Duration::seconds(42)), "42s");
        assert_eq!(format_age(Duration::seconds(-3)), "0s");
        assert_eq!(format_age(Duration::minutes(12)), "12m");
        assert_eq!(format_age(Duration::minutes(200)), "3h");
        assert_eq!(format_age(Duration::days(5)), "5d");
        assert_eq!(format_age(Duration::days(30)), "30d");
        assert_eq!(format_age(Duration::days(45)), "1mo");
        assert_eq!(format_age(Duration::days(800)), "2y");
    }

    #[test]
    fn creation_timestamps_render_as_age() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let column = Column::age("AGE", "/metadata/creationTimestamp");
        let created = |stamp: &str| json!({ "metadata": { "creationTimestamp": stamp } });

        assert_eq!(column.extract_at(&created("2024-05-01T09:00:00Z"), now), "3h");
        assert_eq!(column.extract_at(&created("2024-04-20T12:00:00Z"), now), "11d");
        assert_eq!(column.extract_at(&created("yesterday"), now), UNKNOWN);
        assert_eq!(column.extract_at(&json!({}), now), MISSING);
    }

    #[test]
    fn numbers_render_without_quotes() {
        let column = Column::new("REPLICAS", "/spec/replicas");
        assert_eq!(column.extract(&json!({ "spec": { "replicas": 3 } })), "3");
        assert_eq!(column.extract(&json!({})), MISSING);
    }

    #[test]
    fn search_requires_every_term() {
        let view = ResourceView::for_kind(&"Pod".parse().unwrap());
        let names = |query: &str| -> Vec<String> {
            view.search(&pods(), query)
                .into_iter()
                .map(|record| record.key.name)
                .collect()
        };

        assert_eq!(names("running"), vec!["api-7d9f", "frontend"]);
        assert_eq!(names("BACKEND running"), vec!["api-7d9f"]);
        assert_eq!(names("web worker-1"), Vec::<String>::new());
        assert_eq!(names("").len(), 3);
    }

    #[test]
    fn quoted_phrases_are_single_terms() {
        assert_eq!(
            search_terms(r#"ns "Two Words"  x"#),
            vec!["ns", "two words", "x"]
        );
        assert_eq!(search_terms("  "), Vec::<String>::new());
    }
}
