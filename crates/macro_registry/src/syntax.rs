use std::time::Duration;

use core_types::CoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MacroSyntaxError {
    #[error("empty macro body")]
    Empty,
    #[error("unbalanced braces: {open} open, {close} close")]
    Unbalanced { open: usize, close: usize },
    #[error("line {line}: expected `macro <name> {{` or `automacro <name> {{`")]
    BadHeader { line: usize },
    #[error("line {line}: statement outside of any block")]
    StrayLine { line: usize },
    #[error("line {line}: nested blocks are not supported")]
    NestedBlock { line: usize },
    #[error("block `{name}` is never closed")]
    Unterminated { name: String },
    #[error("automacro `{name}` has no `call` statement")]
    MissingCall { name: String },
    #[error("line {line}: `{keyword}` needs an argument")]
    MissingArgument { line: usize, keyword: &'static str },
    #[error("line {line}: bad pause duration `{value}`")]
    BadPause { line: usize, value: String },
    #[error("line {line}: unknown statement `{text}`")]
    UnknownStatement { line: usize, text: String },
}

impl From<MacroSyntaxError> for CoreError {
    fn from(err: MacroSyntaxError) -> Self {
        CoreError::MacroSyntax(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MacroStep {
    Do(String),
    Pause(Duration),
    Log(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MacroBlock {
    Macro {
        name: String,
        steps: Vec<MacroStep>,
    },
    /// Trigger definition; the conditions are kept verbatim for the game client.
    Automacro {
        name: String,
        conditions: Vec<String>,
        call: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacroProgram {
    pub blocks: Vec<MacroBlock>,
}

impl MacroProgram {
    /// Executable steps of every `macro` block, in definition order.
    pub fn steps(&self) -> impl Iterator<Item = &MacroStep> {
        self.blocks.iter().flat_map(|b| match b {
            MacroBlock::Macro { steps, .. } => steps.as_slice(),
            MacroBlock::Automacro { .. } => &[][..],
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Macro,
    Automacro,
}

struct OpenBlock {
    kind: BlockKind,
    name: String,
    lines: Vec<(usize, String)>,
}

/// Validates and parses a macro file.
pub fn parse(body: &str) -> Result<MacroProgram, MacroSyntaxError> {
    if body.trim().is_empty() {
        return Err(MacroSyntaxError::Empty);
    }
    let open = body.matches('{').count();
    let close = body.matches('}').count();
    if open != close {
        return Err(MacroSyntaxError::Unbalanced { open, close });
    }

    let mut blocks = Vec::new();
    let mut current: Option<OpenBlock> = None;
    for (idx, raw) in body.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match current.as_mut() {
            None => current = Some(parse_header(line, line_no)?),
            Some(block) => {
                if line == "}" {
                    if let Some(done) = current.take() {
                        blocks.push(close_block(done)?);
                    }
                } else if line.ends_with('{') {
                    return Err(MacroSyntaxError::NestedBlock { line: line_no });
                } else {
                    block.lines.push((line_no, line.to_string()));
                }
            }
        }
    }
    if let Some(block) = current {
        return Err(MacroSyntaxError::Unterminated { name: block.name });
    }
    if blocks.is_empty() {
        return Err(MacroSyntaxError::Empty);
    }
    Ok(MacroProgram { blocks })
}

fn parse_header(line: &str, line_no: usize) -> Result<OpenBlock, MacroSyntaxError> {
    let Some(head) = line.strip_suffix('{') else {
        return Err(if line.starts_with("macro") || line.starts_with("automacro") {
            MacroSyntaxError::BadHeader { line: line_no }
        } else {
            MacroSyntaxError::StrayLine { line: line_no }
        });
    };
    let mut parts = head.split_whitespace();
    let kind = match parts.next() {
        Some("macro") => BlockKind::Macro,
        Some("automacro") => BlockKind::Automacro,
        _ => return Err(MacroSyntaxError::BadHeader { line: line_no }),
    };
    match (parts.next(), parts.next()) {
        (Some(name), None) => Ok(OpenBlock {
            kind,
            name: name.to_string(),
            lines: Vec::new(),
        }),
        _ => Err(MacroSyntaxError::BadHeader { line: line_no }),
    }
}

fn close_block(block: OpenBlock) -> Result<MacroBlock, MacroSyntaxError> {
    match block.kind {
        BlockKind::Macro => {
            let steps = block
                .lines
                .iter()
                .map(|(line_no, text)| parse_step(*line_no, text))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MacroBlock::Macro {
                name: block.name,
                steps,
            })
        }
        BlockKind::Automacro => {
            let mut call = None;
            let mut conditions = Vec::new();
            for (_, text) in block.lines {
                match text.split_once(char::is_whitespace) {
                    Some(("call", target)) if !target.trim().is_empty() => {
                        call = Some(target.trim().to_string());
                    }
                    _ => conditions.push(text),
                }
            }
            let Some(call) = call else {
                return Err(MacroSyntaxError::MissingCall { name: block.name });
            };
            Ok(MacroBlock::Automacro {
                name: block.name,
                conditions,
                call,
            })
        }
    }
}

fn parse_step(line: usize, text: &str) -> Result<MacroStep, MacroSyntaxError> {
    let (keyword, arg) = match text.split_once(char::is_whitespace) {
        Some((k, rest)) => (k, rest.trim()),
        None => (text, ""),
    };
    match keyword {
        "do" if arg.is_empty() => Err(MacroSyntaxError::MissingArgument { line, keyword: "do" }),
        "do" => Ok(MacroStep::Do(arg.to_string())),
        "pause" => {
            let secs = if arg.is_empty() { Ok(1.0) } else { arg.parse::<f64>() };
            match secs {
                Ok(s) if s.is_finite() && s >= 0.0 => Ok(MacroStep::Pause(Duration::from_secs_f64(s))),
                _ => Err(MacroSyntaxError::BadPause {
                    line,
                    value: arg.to_string(),
                }),
            }
        }
        "log" => Ok(MacroStep::Log(arg.to_string())),
        _ => Err(MacroSyntaxError::UnknownStatement {
            line,
            text: text.to_string(),
        }),
    }
}
