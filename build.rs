use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source directories subject to the policy scan.
const SOURCE_DIRS: [&str; 8] = [
    "engine", "onto", "network", "diffuse", "shared", "cli", "tests", "benches",
];

const FORBIDDEN_WORDS_PATTERN: &str = r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)";
const STARS_PATTERN: &str = r"(//|/\*).*\*\*";
const COMMENT_PATTERN: &str = r"(//|/\*|///).*";
const UNDERSCORE_PATTERN: &str = r"\b(_[a-zA-Z0-9_]+)\b";
const DEAD_CODE_PATTERN: &str = r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]";

/// Which rule a collector enforces. Each rule filters raw regex matches
/// differently before recording a violation.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => UNDERSCORE_PATTERN,
            Rule::ForbiddenWord => FORBIDDEN_WORDS_PATTERN,
            Rule::StarsInComment => STARS_PATTERN,
            Rule::UppercaseComment => COMMENT_PATTERN,
            Rule::AllowDeadCode => DEAD_CODE_PATTERN,
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => "underscore-prefixed variables",
            Rule::ForbiddenWord => "forbidden comment markers",
            Rule::StarsInComment => "'**' markers in regular comments",
            Rule::UppercaseComment => "all-uppercase comments",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed variable names are not allowed. Use the value or remove the binding."
            }
            Rule::ForbiddenWord => {
                "Comments describe the code as it is, not the history of edits to it."
            }
            Rule::StarsInComment => "Emphasis markers are only allowed in doc comments.",
            Rule::UppercaseComment => "Write comments in sentence case.",
            Rule::AllowDeadCode => {
                "Either use the code (removing the attribute) or remove it completely."
            }
        }
    }

    // Returns false when the matched line should not count as a violation.
    fn applies_to(self, line_text: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment(line_text) && !underscore_in_string(line_text),
            Rule::StarsInComment => !is_doc_comment(line_text),
            Rule::UppercaseComment => comment_is_all_uppercase(line_text),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
        }
    }
}

// Collects every matching line of one file for a single rule.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.headline(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.rule.applies_to(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// True when an underscore-prefixed word only ever appears inside a string literal.
fn underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_is_all_uppercase(line: &str) -> bool {
    let trimmed = line.trim_start();
    let comment_text = if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
    {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        match rest.find("*/") {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else {
        return false;
    };

    let mut letters = comment_text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(|c| c.is_uppercase())
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in source_files() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule::UnderscoreBinding,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }

    let build_timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=KINMAP_BUILD_TIMESTAMP={build_timestamp}");
}
