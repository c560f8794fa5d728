use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source roots checked by the policy scan. The read-only reference material
// next to the crate is deliberately left out.
const SOURCE_DIRS: [&str; 9] = [
    "engine", "net", "survival", "benefit", "evaluate", "shared", "src", "tests", "benches",
];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// One source policy: a line regex plus a filter deciding which matches count.
struct Rule {
    pattern: String,
    accept: fn(&str) -> bool,
    message: &'static str,
}

// Collects violating lines of one file for one rule.
struct Collector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let body = &line[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

// Underscore-prefixed bindings outside comments and string literals.
fn accept_underscore(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn accept_forbidden_word(line: &str) -> bool {
    is_comment(line)
}

// `**` is allowed for emphasis in doc comments only.
fn accept_stars(line: &str) -> bool {
    is_comment(line) && !is_doc_comment(line)
}

fn accept_all_caps(line: &str) -> bool {
    let Some(text) = is_comment(line).then(|| comment_text(line)).flatten() else {
        return false;
    };
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn accept_any(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accept: accept_underscore,
            message: "Underscore-prefixed variable names are not allowed in this project. \
                      Either use the variable (removing the underscore) or remove it completely.",
        },
        Rule {
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            accept: accept_forbidden_word,
            message: "Comments describing edits (FIXED, NEW, UPDATED, ...) are forbidden. \
                      Remove them completely rather than commenting them out.",
        },
        Rule {
            pattern: r"(//|/\*).*\*\*".to_string(),
            accept: accept_stars,
            message: "The '**' pattern is not allowed in regular comments.",
        },
        Rule {
            pattern: r"(//|/\*).*".to_string(),
            accept: accept_all_caps,
            message: "Comments where all alphabetic characters are uppercase are forbidden.",
        },
        Rule {
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accept: accept_any,
            message: "#[allow(dead_code)] is forbidden. Use the code or remove it.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .map(Path::new)
        .filter(|dir| dir.exists())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(files: &[PathBuf], rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: {} policy violations in {}:\n",
                collector.violations.len(),
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.message));
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = source_files();
    for rule in rules() {
        if let Err(e) = scan(&files, &rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
