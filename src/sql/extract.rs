//! Mining embedded query sites from changed source files.
//!
//! The scanner walks Python sources line by line, finds string literals whose
//! content starts with a configured SQL keyword, and records each as a
//! [`QuerySite`] with an exact span. `original_text` is the literal's content
//! exactly as it appears in the file, so the slice `[line_start, line_end]`
//! always contains it verbatim at the moment of discovery.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::core::context::QuerySite;

/// Scan the given files (stable order) and collect every embedded query.
pub fn extract_sites(
    files: &[std::path::PathBuf],
    keywords: &[String],
    dialect: &str,
) -> Result<Vec<QuerySite>> {
    let mut sites = Vec::new();
    let mut sorted: Vec<_> = files.to_vec();
    sorted.sort();

    for path in &sorted {
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        if !path.exists() {
            // Deleted by the user's commit; nothing to scan.
            continue;
        }
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        sites.extend(scan_source(path, &source, keywords, dialect));
    }

    debug!(count = sites.len(), "embedded query sites found");
    Ok(sites)
}

/// Scan one file's source text.
pub fn scan_source(
    path: &Path,
    source: &str,
    keywords: &[String],
    dialect: &str,
) -> Vec<QuerySite> {
    let lines: Vec<&str> = source.lines().collect();
    let defs = collect_defs(&lines);
    let mut sites = Vec::new();

    let mut line_no = 0usize;
    while line_no < lines.len() {
        let line = lines[line_no];

        if let Some((delim_pos, delim)) = find_triple_quote(line) {
            let after = &line[delim_pos + 3..];
            if let Some(close) = after.find(delim) {
                // Triple-quoted literal opened and closed on one line.
                let content = &after[..close];
                if starts_with_keyword(content, keywords) {
                    sites.push(site_at(
                        path, &defs, line_no + 1, line_no + 1, content, dialect,
                    ));
                }
                line_no += 1;
                continue;
            }
            // Multiline literal: accumulate until the closing delimiter.
            let mut content = String::from(after);
            let mut end_line = lines.len() - 1;
            let mut closed = false;
            for (offset, later) in lines[line_no + 1..].iter().enumerate() {
                content.push('\n');
                if let Some(close) = later.find(delim) {
                    content.push_str(&later[..close]);
                    end_line = line_no + 1 + offset;
                    closed = true;
                    break;
                }
                content.push_str(later);
            }
            if closed && starts_with_keyword(&content, keywords) {
                sites.push(site_at(
                    path, &defs, line_no + 1, end_line + 1, &content, dialect,
                ));
            }
            line_no = end_line + 1;
            continue;
        }

        for content in single_line_literals(line) {
            if starts_with_keyword(content, keywords) {
                sites.push(site_at(
                    path, &defs, line_no + 1, line_no + 1, content, dialect,
                ));
            }
        }
        line_no += 1;
    }

    sites
}

/// Tables referenced by a query: identifiers after FROM / JOIN / INTO / UPDATE.
pub fn referenced_tables(query: &str) -> Vec<String> {
    static TABLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TABLE_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:FROM|JOIN|INTO|UPDATE)\s+([A-Za-z_][A-Za-z0-9_.]*)")
            .expect("table regex")
    });
    let mut tables: Vec<String> = re
        .captures_iter(query)
        .map(|cap| cap[1].to_string())
        .collect();
    tables.sort();
    tables.dedup();
    tables
}

fn site_at(
    path: &Path,
    defs: &[(usize, String)],
    line_start: usize,
    line_end: usize,
    content: &str,
    dialect: &str,
) -> QuerySite {
    QuerySite {
        file_path: path.to_path_buf(),
        symbol: enclosing_symbol(defs, line_start),
        line_start,
        line_end,
        original_text: content.to_string(),
        dialect: dialect.to_string(),
        referenced_tables: referenced_tables(content),
    }
}

fn starts_with_keyword(content: &str, keywords: &[String]) -> bool {
    let upper = content.trim_start().to_ascii_uppercase();
    keywords.iter().any(|kw| {
        let kw = kw.to_ascii_uppercase();
        upper.starts_with(&kw)
            && upper[kw.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_ascii_alphanumeric())
    })
}

fn find_triple_quote(line: &str) -> Option<(usize, &'static str)> {
    let double = line.find(r#"""""#);
    let single = line.find("'''");
    match (double, single) {
        (Some(d), Some(s)) if s < d => Some((s, "'''")),
        (Some(d), _) => Some((d, r#"""""#)),
        (None, Some(s)) => Some((s, "'''")),
        (None, None) => None,
    }
}

/// Contents of plain single-line string literals on one line.
fn single_line_literals(line: &str) -> Vec<&str> {
    let mut literals = Vec::new();
    let mut rest = line;
    while let Some(open) = rest.find(['"', '\'']) {
        let quote = rest.as_bytes()[open] as char;
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find(quote) else {
            break;
        };
        literals.push(&after_open[..close]);
        rest = &after_open[close + 1..];
    }
    literals
}

/// `(first_line, name)` for every `def`, 1-based.
fn collect_defs(lines: &[&str]) -> Vec<(usize, String)> {
    static DEF_RE: OnceLock<Regex> = OnceLock::new();
    let re = DEF_RE.get_or_init(|| {
        Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)").expect("def regex")
    });

    lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| re.captures(line).map(|cap| (idx + 1, cap[1].to_string())))
        .collect()
}

/// The closest `def` preceding `line`, or `"module"` at top level.
fn enclosing_symbol(defs: &[(usize, String)], line: usize) -> String {
    defs.iter()
        .rev()
        .find(|(def_line, _)| *def_line <= line)
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| "module".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn keywords() -> Vec<String> {
        ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn finds_single_line_literal_with_span_and_symbol() {
        let source = "\
import db


def load_users(conn):
    return conn.execute(\"SELECT * FROM users WHERE status='active'\")
";
        let sites = scan_source(Path::new("app/repo.py"), source, &keywords(), "postgresql");
        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.line_start, 5);
        assert_eq!(site.line_end, 5);
        assert_eq!(site.symbol, "load_users");
        assert_eq!(
            site.original_text,
            "SELECT * FROM users WHERE status='active'"
        );
        assert_eq!(site.referenced_tables, vec!["users"]);
    }

    #[test]
    fn finds_multiline_triple_quoted_literal() {
        let source = "\
def report(conn):
    query = \"\"\"
    SELECT u.id, o.total
    FROM users u
    JOIN orders o ON o.user_id = u.id
    \"\"\"
    return conn.execute(query)
";
        let sites = scan_source(Path::new("app/report.py"), source, &keywords(), "postgresql");
        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.line_start, 2);
        assert_eq!(site.line_end, 6);
        assert_eq!(site.symbol, "report");
        assert!(site.original_text.contains("JOIN orders o"));
        assert_eq!(site.referenced_tables, vec!["orders", "users"]);
    }

    #[test]
    fn slice_contains_original_text() {
        let source = "\
def q(conn):
    sql = '''SELECT id
    FROM users'''
    return conn.execute(sql)
";
        let sites = scan_source(Path::new("a.py"), source, &keywords(), "postgresql");
        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        let lines: Vec<&str> = source.lines().collect();
        let slice = lines[site.line_start - 1..site.line_end].join("\n");
        assert!(slice.contains(&site.original_text));
    }

    #[test]
    fn non_sql_strings_are_ignored() {
        let source = "def f():\n    name = 'selector widget'\n    return name\n";
        let sites = scan_source(Path::new("a.py"), source, &keywords(), "postgresql");
        assert!(sites.is_empty());
    }

    #[test]
    fn top_level_literal_belongs_to_module() {
        let source = "QUERY = \"SELECT 1\"\n";
        let sites = scan_source(Path::new("a.py"), source, &keywords(), "postgresql");
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].symbol, "module");
    }

    #[test]
    fn only_python_files_are_scanned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let py = temp.path().join("a.py");
        let txt = temp.path().join("b.txt");
        std::fs::write(&py, "Q = \"SELECT 1\"\n").expect("write");
        std::fs::write(&txt, "SELECT 1\n").expect("write");

        let sites = extract_sites(
            &[py, txt, PathBuf::from(temp.path().join("missing.py"))],
            &keywords(),
            "postgresql",
        )
        .expect("extract");
        assert_eq!(sites.len(), 1);
    }

    #[test]
    fn table_extraction_dedupes_and_sorts() {
        let tables = referenced_tables(
            "SELECT * FROM users u JOIN orders o ON o.uid = u.id JOIN users x ON x.id = o.ref",
        );
        assert_eq!(tables, vec!["orders", "users"]);
    }
}
