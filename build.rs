use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

// Directories holding this crate's own Rust sources. Everything else in the
// tree, build output included, is outside the policy.
const SOURCE_DIRS: [&str; 5] = ["src", "surface", "cli", "tests", "benches"];

// Source policy rules, each a line regex plus a post-filter on the matched line.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ChangeLogComment,
    StarsInComment,
    ShoutingComment,
    AllowDeadCode,
}

const RULES: [Rule; 5] = [
    Rule::UnderscoreBinding,
    Rule::ChangeLogComment,
    Rule::StarsInComment,
    Rule::ShoutingComment,
    Rule::AllowDeadCode,
];

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ChangeLogComment => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::ShoutingComment => r"(//|/\*).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::ChangeLogComment => {
                "Change-log words (FIX, NEW, CHANGED, UPDATED, ...) do not belong in comments."
            }
            Rule::StarsInComment => "The '**' pattern is only allowed in '///' doc comments.",
            Rule::ShoutingComment => "Comments written entirely in uppercase are not allowed.",
            Rule::AllowDeadCode => "#[allow(dead_code)] is not allowed. Use the code or delete it.",
        }
    }

    // Whether a line the regex matched is a real violation.
    fn applies(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Rule::UnderscoreBinding => !trimmed.starts_with("//") && !underscore_in_string(line),
            Rule::ChangeLogComment | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !trimmed.starts_with("///"),
            Rule::ShoutingComment => comment_text(trimmed).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

fn underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("///").or_else(|| line.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = line.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

// Collects the violating lines of one file for one rule.
struct LineCollector {
    rule: Rule,
    hits: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.applies(line_text) {
            self.hits.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

// Every `.rs` file under the crate's source directories.
fn rust_sources() -> impl Iterator<Item = DirEntry> {
    SOURCE_DIRS
        .into_iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
}

fn scan(rule: Rule) -> Result<Vec<String>, Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();
    let mut report = Vec::new();

    for entry in rust_sources() {
        let path = entry.path();
        let mut collector = LineCollector {
            rule,
            hits: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        for hit in collector.hits {
            report.push(format!("   {}:{hit}", path.display()));
        }
    }
    Ok(report)
}

// Compiles this script on its own with the strict lints the crate uses.
fn check_build_script_lints() {
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--out-dir",
        ])
        .arg(std::env::var("OUT_DIR").unwrap_or_else(|_| ".".to_string()))
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lint_failure = ["unused variable", "is never used", "unused import"]
                .iter()
                .any(|needle| stderr.contains(needle));
            if lint_failure {
                eprintln!("\n❌ ERROR: build.rs violates the crate's lint policy:\n{stderr}");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => println!("cargo:warning=Could not lint build.rs with rustc"),
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script_lints();

    let mut failed = false;
    for rule in RULES {
        match scan(rule) {
            Ok(report) if report.is_empty() => {}
            Ok(report) => {
                failed = true;
                eprintln!("\n❌ ERROR: {} violation(s):", report.len());
                for line in report {
                    eprintln!("{line}");
                }
                eprintln!("⚠️ {}", rule.explanation());
            }
            Err(e) => {
                failed = true;
                eprintln!("{e}");
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}
