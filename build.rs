use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own sources.
const SOURCE_DIRS: &[&str] = &["src", "mad", "radcal", "shared", "cli", "tests", "benches"];

#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Self::ForbiddenComment => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)"
            }
            Self::AllowDeadCode => r"#\[allow\(dead_code\)\]",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => "underscore-prefixed identifiers",
            Self::ForbiddenComment => "forbidden comment markers",
            Self::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => {
                "Either use the binding (removing the underscore) or remove it completely."
            }
            Self::ForbiddenComment => {
                "Comments narrating edits (FIX, NEW, CHANGE, UPDATE, ...) must be removed."
            }
            Self::AllowDeadCode => "Either use the code or remove it completely.",
        }
    }
}

// Collects every matching line of one file for a single rule.
struct ViolationCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.describe(),
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if let Rule::UnderscorePrefix = self.rule {
            // Comments and string literals may mention such names freely.
            let is_comment = line_text.trim_start().starts_with("//");
            let in_string = line_text
                .split('"')
                .enumerate()
                .any(|(i, part)| i % 2 == 1 && part.contains('_'));
            if is_comment || in_string {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
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
        if let Some(message) = collector.error_message() {
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

    for rule in [
        Rule::UnderscorePrefix,
        Rule::ForbiddenComment,
        Rule::AllowDeadCode,
    ] {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
