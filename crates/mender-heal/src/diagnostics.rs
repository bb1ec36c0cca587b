//! Compiler / linter output parsing.
//!
//! Recognised forms:
//!
//! - `src/app.ts(12,5): error TS2322: message` (tsc)
//! - `src/app.ts:12:5 - error TS2322: message` (tsc --pretty)
//! - `src/main.c:3:7: error: message` (gcc, clang, eslint unix)
//! - `error[E0308]: message` followed by `  --> src/main.rs:4:9` (rustc)
//!
//! Warnings are ignored, and a rustc `-->` location only counts when it belongs
//! to an `error` header. Identical diagnostics reported twice (e.g. by a
//! watch-mode rebuild) are kept once.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern"));

static TSC_PAREN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s(][^(]*?)\((?P<line>\d+),(?P<col>\d+)\):\s*error\s*(?P<code>[A-Z]+\d+)?:?\s*(?P<msg>.+)$")
        .expect("tsc pattern")
});

static TSC_PRETTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:][^:]*?):(?P<line>\d+):(?P<col>\d+)\s+-\s+error\s*(?P<code>[A-Z]+\d+)?:?\s*(?P<msg>.+)$")
        .expect("tsc pretty pattern")
});

static GCC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:][^:]*?):(?P<line>\d+):(?P<col>\d+):\s*(?:fatal\s+)?error:\s*(?P<msg>.+)$")
        .expect("gcc pattern")
});

static RUSTC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^error(?:\[(?P<code>E\d+)\])?:\s*(?P<msg>.+)$").expect("rustc header pattern")
});

static RUSTC_OTHER_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:warning|note|help)(?:\[[^\]]+\])?:").expect("rustc non-error header pattern")
});

static RUSTC_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-->\s*(?P<file>[^:]+):(?P<line>\d+):(?P<col>\d+)").expect("rustc location pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl Diagnostic {
    /// Compact one-line form handed to the file fixer.
    pub fn to_error_string(&self) -> String {
        match &self.code {
            Some(code) => format!("{}:{} {}: {}", self.line, self.column, code, self.message),
            None => format!("{}:{} {}", self.line, self.column, self.message),
        }
    }
}

/// Parsed diagnostics, flat and grouped by file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildDiagnostics {
    pub errors: Vec<Diagnostic>,
    pub by_file: BTreeMap<String, Vec<Diagnostic>>,
}

impl BuildDiagnostics {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Up to `limit` files ordered by error count (desc), then path, each with
    /// its errors in fixer form.
    pub fn worst_files(&self, limit: usize) -> Vec<(String, Vec<String>)> {
        let mut files: Vec<(&String, &Vec<Diagnostic>)> = self.by_file.iter().collect();
        files.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
        files
            .into_iter()
            .take(limit)
            .map(|(file, diags)| {
                (
                    file.clone(),
                    diags.iter().map(Diagnostic::to_error_string).collect(),
                )
            })
            .collect()
    }

    fn push(&mut self, seen: &mut HashSet<Diagnostic>, diag: Diagnostic) {
        if seen.insert(diag.clone()) {
            self.by_file
                .entry(diag.file.clone())
                .or_default()
                .push(diag.clone());
            self.errors.push(diag);
        }
    }
}

/// Build a diagnostic from a location match; `code`/`message` override the captures.
fn capture(caps: &regex::Captures<'_>, code: Option<String>, message: Option<String>) -> Option<Diagnostic> {
    Some(Diagnostic {
        file: caps.name("file")?.as_str().trim().to_string(),
        line: caps.name("line")?.as_str().parse().ok()?,
        column: caps.name("col")?.as_str().parse().ok()?,
        code: code.or_else(|| caps.name("code").map(|m| m.as_str().to_string())),
        message: message.or_else(|| caps.name("msg").map(|m| m.as_str().trim().to_string()))?,
    })
}

/// Extract error diagnostics from combined build/test output.
pub fn parse_build_errors(output: &str) -> BuildDiagnostics {
    let clean = ANSI.replace_all(output, "");
    let mut diagnostics = BuildDiagnostics::default();
    let mut seen = HashSet::new();
    // rustc header awaiting its `-->` location
    let mut pending: Option<(Option<String>, String)> = None;

    for raw in clean.lines() {
        let line = raw.trim_end();

        if let Some(caps) = RUSTC_HEADER.captures(line) {
            pending = Some((
                caps.name("code").map(|m| m.as_str().to_string()),
                caps.name("msg").map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            ));
            continue;
        }
        if RUSTC_OTHER_HEADER.is_match(line) {
            pending = None;
            continue;
        }
        if let Some(caps) = RUSTC_LOCATION.captures(line) {
            if let Some((code, message)) = pending.take() {
                if let Some(diag) = capture(&caps, code, Some(message)) {
                    diagnostics.push(&mut seen, diag);
                }
            }
            continue;
        }
        // only indented continuation lines keep a header waiting
        if !line.starts_with(char::is_whitespace) {
            pending = None;
        }

        let line = line.trim_start();
        let caps = TSC_PAREN
            .captures(line)
            .or_else(|| TSC_PRETTY.captures(line))
            .or_else(|| GCC.captures(line));
        if let Some(caps) = caps {
            if let Some(diag) = capture(&caps, None, None) {
                diagnostics.push(&mut seen, diag);
            }
        }
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tsc_paren_style() {
        let out = "src/app.ts(12,5): error TS2322: Type 'string' is not assignable to type 'number'.\n";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 1);
        let e = &d.errors[0];
        assert_eq!(e.file, "src/app.ts");
        assert_eq!((e.line, e.column), (12, 5));
        assert_eq!(e.code.as_deref(), Some("TS2322"));
        assert_eq!(e.message, "Type 'string' is not assignable to type 'number'.");
    }

    #[test]
    fn parses_tsc_pretty_with_colors() {
        let out = "\x1b[96msrc/util.ts\x1b[0m:\x1b[93m3\x1b[0m:\x1b[93m10\x1b[0m - \x1b[91merror\x1b[0m TS2304: Cannot find name 'foo'.";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 1);
        assert_eq!(d.errors[0].file, "src/util.ts");
        assert_eq!(d.errors[0].line, 3);
        assert_eq!(d.errors[0].code.as_deref(), Some("TS2304"));
    }

    #[test]
    fn parses_gcc_and_skips_warnings() {
        let out = "\
main.c:3:7: warning: unused variable 'x'
main.c:9:1: error: expected ';' before '}' token
lib/io.c:20:3: fatal error: stdio2.h: No such file or directory
";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 2);
        assert_eq!(d.errors[0].message, "expected ';' before '}' token");
        assert_eq!(d.errors[1].file, "lib/io.c");
    }

    #[test]
    fn parses_rustc_header_and_location() {
        let out = "\
error[E0308]: mismatched types
  --> src/main.rs:4:9
   |
4  |     let x: u32 = \"a\";
   |            ---   ^^^ expected `u32`, found `&str`

error: aborting due to 1 previous error
";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 1);
        let e = &d.errors[0];
        assert_eq!(e.file, "src/main.rs");
        assert_eq!((e.line, e.column), (4, 9));
        assert_eq!(e.code.as_deref(), Some("E0308"));
        assert_eq!(e.message, "mismatched types");
    }

    #[test]
    fn rustc_error_without_location_does_not_claim_a_warning_location() {
        let out = "error: linking with `cc` failed\nwarning: unused variable: `x`\n --> src/lib.rs:3:9\n";
        let d = parse_build_errors(out);
        assert!(d.is_empty(), "unexpected diagnostics: {:?}", d.errors);
    }

    #[test]
    fn rustc_header_expires_at_the_next_unindented_line() {
        let out = "\
error: could not compile `app`
Caused by: process didn't exit successfully
  --> src/main.rs:1:1

error[E0425]: cannot find value `y` in this scope
 --> src/main.rs:7:13
  |
";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 1);
        assert_eq!(d.errors[0].code.as_deref(), Some("E0425"));
        assert_eq!((d.errors[0].line, d.errors[0].column), (7, 13));
    }

    #[test]
    fn deduplicates_and_ranks_files() {
        let out = "\
a.ts(1,1): error TS1: one
a.ts(1,1): error TS1: one
b.ts(2,2): error TS2: two
b.ts(3,3): error TS3: three
c.ts(4,4): error TS4: four
";
        let d = parse_build_errors(out);
        assert_eq!(d.error_count(), 4);
        assert_eq!(d.by_file["a.ts"].len(), 1);

        let worst = d.worst_files(2);
        assert_eq!(worst.len(), 2);
        assert_eq!(worst[0].0, "b.ts");
        assert_eq!(worst[0].1, vec!["2:2 TS2: two", "3:3 TS3: three"]);
        assert_eq!(worst[1].0, "a.ts");
    }

    #[test]
    fn nothing_parseable() {
        let d = parse_build_errors("npm ERR! missing script: build\n");
        assert!(d.is_empty());
        assert!(d.worst_files(5).is_empty());
    }
}
