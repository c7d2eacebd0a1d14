//! Dockerfile parser.
//!
//! Turns Dockerfile text into a sequence of [`Instruction`]s. Handles line
//! continuations, comments, exec (JSON) and shell forms, and multi-pair
//! `ENV`/`LABEL`.

use stevedore_core::error::{ImageError, Result};

use crate::changes::shell_words;

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From { image: String, alias: Option<String> },
    /// `RUN <command>`
    Run { command: String },
    /// `COPY [--from=<stage>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        from: Option<String>,
    },
    /// `ADD <src>... <dst>`; local tar archives are extracted.
    Add { src: Vec<String>, dst: String },
    Workdir { path: String },
    Env { pairs: Vec<(String, String)> },
    Entrypoint { exec: Vec<String> },
    Cmd { exec: Vec<String> },
    Expose { ports: Vec<String> },
    Label { pairs: Vec<(String, String)> },
    User { user: String },
    Volume { paths: Vec<String> },
    StopSignal { signal: String },
    Arg { name: String, default: Option<String> },
}

impl Instruction {
    /// Keyword as written in a Dockerfile.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Label { .. } => "LABEL",
            Instruction::User { .. } => "USER",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::StopSignal { .. } => "STOPSIGNAL",
            Instruction::Arg { .. } => "ARG",
        }
    }
}

/// A parsed instruction together with its source text, used for history.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub instruction: Instruction,
    pub text: String,
}

/// Parsed Dockerfile.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub steps: Vec<Step>,
}

impl Dockerfile {
    pub fn parse(content: &str) -> Result<Self> {
        let mut steps = Vec::new();

        for (line_num, line) in join_continuation_lines(content).iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(instruction) = parse_instruction(trimmed, line_num + 1)? {
                steps.push(Step {
                    instruction,
                    text: trimmed.to_string(),
                });
            }
        }

        if steps.is_empty() {
            return Err(ImageError::Build(
                "Dockerfile is empty or contains no instructions".to_string(),
            ));
        }

        let first = steps
            .iter()
            .find(|s| !matches!(s.instruction, Instruction::Arg { .. }));
        if !matches!(
            first.map(|s| &s.instruction),
            Some(Instruction::From { .. })
        ) {
            return Err(ImageError::Build(
                "First instruction must be FROM (or ARG before FROM)".to_string(),
            ));
        }

        Ok(Dockerfile { steps })
    }

    /// Parse the concatenation of several Dockerfiles, in order.
    pub fn parse_all(contents: &[String]) -> Result<Self> {
        Self::parse(&contents.join("\n"))
    }
}

/// Join lines ending with `\` into single logical lines. Comment lines
/// inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<String> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        let trimmed_end = line.trim_end();
        if let Some(body) = trimmed_end.strip_suffix('\\') {
            current.push_str(body.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        logical_lines.push(current);
    }
    logical_lines
}

/// Parse one logical line. `None` for instructions that are accepted but
/// have no effect on the produced image.
fn parse_instruction(line: &str, line_num: usize) -> Result<Option<Instruction>> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();
    let require = |what: &str| -> Result<()> {
        if rest.is_empty() {
            Err(ImageError::Build(format!(
                "Line {}: {} requires {}",
                line_num, keyword_upper, what
            )))
        } else {
            Ok(())
        }
    };

    let instruction = match keyword_upper.as_str() {
        "FROM" => {
            require("an image argument")?;
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let alias = match parts.as_slice() {
                [_, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => Some(alias.to_string()),
                [_] => None,
                _ => {
                    return Err(ImageError::Build(format!(
                        "Line {}: malformed FROM '{}'",
                        line_num, rest
                    )))
                }
            };
            Instruction::From {
                image: parts[0].to_string(),
                alias,
            }
        }
        "RUN" => {
            require("a command")?;
            let command = if rest.starts_with('[') {
                parse_json_array(rest, line_num)?.join(" ")
            } else {
                rest.to_string()
            };
            Instruction::Run { command }
        }
        "COPY" | "ADD" => {
            require("source and destination")?;
            let mut from = None;
            let mut remaining = rest;
            while remaining.starts_with("--") {
                let (flag, after) = split_first_word(remaining);
                if let Some(stage) = flag.strip_prefix("--from=") {
                    from = Some(stage.to_string());
                } else {
                    tracing::debug!(line = line_num, flag, "Ignoring COPY/ADD flag");
                }
                remaining = after;
            }
            let mut parts = if remaining.starts_with('[') {
                parse_json_array(remaining, line_num)?
            } else {
                shell_words(remaining)
            };
            if parts.len() < 2 {
                return Err(ImageError::Build(format!(
                    "Line {}: {} requires at least one source and a destination",
                    line_num, keyword_upper
                )));
            }
            let dst = parts.pop().unwrap_or_default();
            if keyword_upper == "ADD" {
                if from.is_some() {
                    return Err(ImageError::Build(format!(
                        "Line {}: ADD does not support --from",
                        line_num
                    )));
                }
                Instruction::Add { src: parts, dst }
            } else {
                Instruction::Copy {
                    src: parts,
                    dst,
                    from,
                }
            }
        }
        "WORKDIR" => {
            require("a path")?;
            Instruction::Workdir {
                path: unquote(rest),
            }
        }
        "ENV" => {
            require("a key and value")?;
            Instruction::Env {
                pairs: parse_pairs(rest, line_num, "ENV")?,
            }
        }
        "LABEL" => {
            require("key=value")?;
            Instruction::Label {
                pairs: parse_pairs(rest, line_num, "LABEL")?,
            }
        }
        "MAINTAINER" => {
            require("a name")?;
            Instruction::Label {
                pairs: vec![("maintainer".to_string(), unquote(rest))],
            }
        }
        "ENTRYPOINT" => {
            require("an argument")?;
            Instruction::Entrypoint {
                exec: exec_form(rest, line_num)?,
            }
        }
        "CMD" => {
            require("an argument")?;
            Instruction::Cmd {
                exec: exec_form(rest, line_num)?,
            }
        }
        "EXPOSE" => {
            require("a port")?;
            Instruction::Expose {
                ports: rest.split_whitespace().map(str::to_string).collect(),
            }
        }
        "USER" => {
            require("a username")?;
            Instruction::User {
                user: rest.split_whitespace().next().unwrap_or(rest).to_string(),
            }
        }
        "VOLUME" => {
            require("a path")?;
            let paths = if rest.starts_with('[') {
                parse_json_array(rest, line_num)?
            } else {
                rest.split_whitespace().map(str::to_string).collect()
            };
            Instruction::Volume { paths }
        }
        "STOPSIGNAL" => {
            require("a signal")?;
            Instruction::StopSignal {
                signal: rest.trim().to_string(),
            }
        }
        "ARG" => {
            require("a name")?;
            match rest.split_once('=') {
                Some((name, default)) => Instruction::Arg {
                    name: name.trim().to_string(),
                    default: Some(unquote(default)),
                },
                None => Instruction::Arg {
                    name: rest.trim().to_string(),
                    default: None,
                },
            }
        }
        "SHELL" | "HEALTHCHECK" | "ONBUILD" => {
            tracing::warn!(
                line = line_num,
                instruction = keyword_upper.as_str(),
                "Unsupported Dockerfile instruction, skipping"
            );
            return Ok(None);
        }
        _ => {
            return Err(ImageError::Build(format!(
                "Line {}: Unknown instruction '{}'",
                line_num, keyword
            )))
        }
    };
    Ok(Some(instruction))
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// `KEY=VALUE ...` pairs, or the legacy single `KEY VALUE` form.
fn parse_pairs(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<(String, String)>> {
    let (first, tail) = split_first_word(rest);
    if !first.contains('=') {
        if tail.is_empty() {
            return Err(ImageError::Build(format!(
                "Line {}: {} {} has no value",
                line_num, keyword, first
            )));
        }
        return Ok(vec![(first.to_string(), unquote(tail))]);
    }

    shell_words(rest)
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ImageError::Build(format!(
                "Line {}: {} expects KEY=VALUE, got '{}'",
                line_num, keyword, word
            ))),
        })
        .collect()
}

/// JSON exec form, or the shell form wrapped in `/bin/sh -c`.
fn exec_form(rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        ImageError::Build(format!(
            "Line {}: Invalid JSON array '{}': {}",
            line_num, s, e
        ))
    })
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(line: &str) -> Instruction {
        parse_instruction(line, 1).unwrap().unwrap()
    }

    #[test]
    fn test_join_continuation_lines() {
        let input = "RUN apt-get update && \\\n    apt-get install -y curl\nFROM x";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("apt-get update"));
        assert!(lines[0].contains("apt-get install"));
    }

    #[test]
    fn test_continuation_skips_comments() {
        let input = "RUN a \\\n# note\n    b";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains("note"));
    }

    #[test]
    fn test_from_with_alias() {
        assert_eq!(
            parse_one("FROM golang:1.21 AS builder"),
            Instruction::From {
                image: "golang:1.21".to_string(),
                alias: Some("builder".to_string()),
            }
        );
        assert_eq!(
            parse_one("from alpine"),
            Instruction::From {
                image: "alpine".to_string(),
                alias: None,
            }
        );
        assert!(parse_instruction("FROM a b", 1).is_err());
    }

    #[test]
    fn test_run_forms() {
        assert_eq!(
            parse_one(r#"RUN ["echo", "hello"]"#),
            Instruction::Run {
                command: "echo hello".to_string()
            }
        );
        assert!(parse_instruction("RUN", 1).is_err());
    }

    #[test]
    fn test_copy_and_add() {
        assert_eq!(
            parse_one("COPY --chown=1000 --from=builder /app/bin /usr/local/bin/"),
            Instruction::Copy {
                src: vec!["/app/bin".to_string()],
                dst: "/usr/local/bin/".to_string(),
                from: Some("builder".to_string()),
            }
        );
        assert_eq!(
            parse_one("ADD rootfs.tar a.txt /opt/"),
            Instruction::Add {
                src: vec!["rootfs.tar".to_string(), "a.txt".to_string()],
                dst: "/opt/".to_string(),
            }
        );
        assert!(parse_instruction("COPY onlysource", 1).is_err());
        assert!(parse_instruction("ADD --from=x a /b", 1).is_err());
    }

    #[test]
    fn test_env_forms() {
        assert_eq!(
            parse_one(r#"ENV A=1 MSG="hello world""#),
            Instruction::Env {
                pairs: vec![
                    ("A".to_string(), "1".to_string()),
                    ("MSG".to_string(), "hello world".to_string())
                ]
            }
        );
        assert_eq!(
            parse_one("ENV MY_VAR my value"),
            Instruction::Env {
                pairs: vec![("MY_VAR".to_string(), "my value".to_string())]
            }
        );
        assert!(parse_instruction("ENV LONELY", 1).is_err());
    }

    #[test]
    fn test_cmd_entrypoint() {
        assert_eq!(
            parse_one(r#"ENTRYPOINT ["/bin/agent", "--listen"]"#),
            Instruction::Entrypoint {
                exec: vec!["/bin/agent".to_string(), "--listen".to_string()]
            }
        );
        assert_eq!(
            parse_one("CMD echo hello"),
            Instruction::Cmd {
                exec: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo hello".to_string()
                ]
            }
        );
        assert!(parse_instruction("CMD [broken", 1).is_err());
    }

    #[test]
    fn test_misc_instructions() {
        assert_eq!(
            parse_one("EXPOSE 80 443/udp"),
            Instruction::Expose {
                ports: vec!["80".to_string(), "443/udp".to_string()]
            }
        );
        assert_eq!(
            parse_one(r#"VOLUME ["/data", "/logs"]"#),
            Instruction::Volume {
                paths: vec!["/data".to_string(), "/logs".to_string()]
            }
        );
        assert_eq!(
            parse_one("MAINTAINER ops"),
            Instruction::Label {
                pairs: vec![("maintainer".to_string(), "ops".to_string())]
            }
        );
        assert_eq!(
            parse_one("ARG VERSION=\"3.19\""),
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: Some("3.19".to_string())
            }
        );
        assert!(parse_instruction("HEALTHCHECK NONE", 1).unwrap().is_none());
        assert!(parse_instruction("FROBNICATE x", 1).is_err());
    }

    #[test]
    fn test_parse_full_dockerfile() {
        let content = r#"
# syntax comment
ARG BASE=alpine:3.19
FROM ${BASE}
WORKDIR /app
COPY . .
CMD ["./run"]
"#;
        let df = Dockerfile::parse(content).unwrap();
        assert_eq!(df.steps.len(), 5);
        assert_eq!(df.steps[1].text, "FROM ${BASE}");
        assert_eq!(df.steps[4].instruction.keyword(), "CMD");
    }

    #[test]
    fn test_first_instruction_must_be_from() {
        assert!(Dockerfile::parse("RUN echo hi\nFROM alpine").is_err());
        assert!(Dockerfile::parse("# nothing\n").is_err());
    }

    #[test]
    fn test_parse_all_concatenates() {
        let df = Dockerfile::parse_all(&[
            "FROM scratch".to_string(),
            "LABEL stage=two".to_string(),
        ])
        .unwrap();
        assert_eq!(df.steps.len(), 2);
    }
}
