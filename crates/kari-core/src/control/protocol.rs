//! Line protocol: one command per line in, one JSON object per line out.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ControlError;
use crate::module::action::ActionArgs;

/// Argument to `debug` / `trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSwitch {
    On,
    Off,
    Toggle,
}

impl FlagSwitch {
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(Self::On),
            "off" | "0" | "false" => Some(Self::Off),
            "toggle" | "t" => Some(Self::Toggle),
            _ => None,
        }
    }

    pub fn apply(self, current: bool) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Toggle => !current,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Status,
    Mods,
    Health,
    Snapshot,
    Help {
        module: Option<String>,
        action: Option<String>,
    },
    Debug(Option<FlagSwitch>),
    Trace(Option<FlagSwitch>),
    Call {
        module: String,
        action: String,
        args: ActionArgs,
    },
    Reload {
        module: String,
    },
    /// Speak the text verbatim through the voice module.
    Speak(String),
    /// Speak a phrase of the given type through the voice module.
    Phrase {
        phrase_type: String,
        mood: Option<String>,
    },
    /// Anything else, forwarded to the default handler.
    FreeForm(String),
}

/// A parsed control line.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub raw: String,
    pub command: Command,
}

impl ControlRequest {
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let raw = line.trim();
        let Some(first) = raw.split_whitespace().next() else {
            return Err(ControlError::unknown_command("Empty command"));
        };

        let verb = first.to_ascii_lowercase();
        let known = matches!(
            verb.as_str(),
            "ping" | "hi" | "status" | "mods" | "modules" | "health" | "snapshot" | "help"
                | "debug" | "trace" | "call" | "reload" | "speak" | "phrase"
        );
        if !known {
            return Ok(Self {
                raw: raw.to_string(),
                command: Command::FreeForm(raw.to_string()),
            });
        }
        // Spoken text is taken as typed, quotes and apostrophes included.
        if verb == "speak" {
            let text = raw[first.len()..].trim();
            if text.is_empty() {
                return Err(ControlError::bad_arguments("Usage: speak <text...>"));
            }
            return Ok(Self {
                raw: raw.to_string(),
                command: Command::Speak(text.to_string()),
            });
        }

        let words = split_words(raw)?;
        let rest = &words[1..];
        let command = match verb.as_str() {
            "ping" | "hi" => Command::Ping,
            "status" => Command::Status,
            "mods" | "modules" => Command::Mods,
            "health" => Command::Health,
            "snapshot" => Command::Snapshot,
            "help" => Command::Help {
                module: rest.first().cloned(),
                action: rest.get(1).cloned(),
            },
            "debug" => Command::Debug(parse_switch("debug", rest)?),
            "trace" => Command::Trace(parse_switch("trace", rest)?),
            "phrase" => match rest {
                [phrase_type] => Command::Phrase {
                    phrase_type: phrase_type.clone(),
                    mood: None,
                },
                [phrase_type, mood] => Command::Phrase {
                    phrase_type: phrase_type.clone(),
                    mood: Some(mood.clone()),
                },
                _ => return Err(ControlError::bad_arguments("Usage: phrase <type> [mood]")),
            },
            "reload" => match rest {
                [module] => Command::Reload {
                    module: module.clone(),
                },
                _ => return Err(ControlError::bad_arguments("Usage: reload <Module>")),
            },
            _ => match rest {
                [module, action, args @ ..] => Command::Call {
                    module: module.clone(),
                    action: action.clone(),
                    args: parse_call_args(args)?,
                },
                _ => {
                    return Err(ControlError::bad_arguments(
                        "Usage: call <Module> <action> [json|words]",
                    ))
                }
            },
        };
        Ok(Self {
            raw: raw.to_string(),
            command,
        })
    }
}

fn parse_switch(verb: &str, rest: &[String]) -> Result<Option<FlagSwitch>, ControlError> {
    match rest {
        [] => Ok(None),
        [word] => FlagSwitch::parse(word).map(Some).ok_or_else(|| {
            ControlError::bad_arguments(format!("Usage: {verb} [on|off|toggle], got `{word}`"))
        }),
        _ => Err(ControlError::bad_arguments(format!("Usage: {verb} [on|off|toggle]"))),
    }
}

/// Turn the words after `call <Module> <action>` into keyword arguments.
///
/// A JSON object is used as-is. Words that are not JSON at all are passed as
/// `{"raw": "<joined>", "args": [...]}`.
pub fn parse_call_args(words: &[String]) -> Result<ActionArgs, ControlError> {
    if words.is_empty() {
        return Ok(ActionArgs::new());
    }
    let joined = words.join(" ");
    match serde_json::from_str::<Value>(&joined) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ControlError::bad_arguments(
            "Arguments must be a JSON object of keyword arguments",
        )),
        Err(e) if joined.trim_start().starts_with('{') => {
            Err(ControlError::bad_arguments(format!("Invalid JSON arguments: {e}")))
        }
        Err(_) => {
            let mut args = ActionArgs::new();
            args.insert("raw".into(), json!(joined));
            args.insert("args".into(), json!(words));
            Ok(args)
        }
    }
}

/// Split a line into words with shell-style quoting: single quotes are
/// literal, double quotes allow `\"` and `\\`, and a backslash outside
/// quotes escapes the next character.
pub fn split_words(line: &str) -> Result<Vec<String>, ControlError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(ControlError::bad_arguments("Unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(ControlError::bad_arguments("Unterminated double quote")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(ControlError::bad_arguments("Unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Short human-readable rendering, when the handler supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            text: None,
            error: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn failure(error: ControlError) -> Self {
        Self {
            ok: false,
            result: None,
            text: None,
            error: Some(error),
        }
    }

    /// Serialized form terminated by `\n`.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            json!({
                "ok": false,
                "error": {"kind": "ActionFailed", "message": format!("Unserializable response: {e}")}
            })
            .to_string()
        });
        line.push('\n');
        line
    }
}

impl From<Result<ControlResponse, ControlError>> for ControlResponse {
    fn from(outcome: Result<ControlResponse, ControlError>) -> Self {
        outcome.unwrap_or_else(Self::failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlErrorKind;

    fn parse(line: &str) -> Command {
        ControlRequest::parse(line).unwrap().command
    }

    fn parse_err(line: &str) -> ControlErrorKind {
        ControlRequest::parse(line).unwrap_err().kind
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"call "Voice Box" say '{"text": "hi there"}'"#).unwrap(),
            vec!["call", "Voice Box", "say", r#"{"text": "hi there"}"#]
        );
        assert_eq!(split_words(r"a\ b  c").unwrap(), vec!["a b", "c"]);
        assert_eq!(split_words(r#""" x"#).unwrap(), vec!["", "x"]);
        assert!(split_words("call 'oops").is_err());
    }

    #[test]
    fn test_verbs_are_case_insensitive() {
        assert_eq!(parse("STATUS"), Command::Status);
        assert_eq!(parse("Modules"), Command::Mods);
        assert_eq!(parse("hi"), Command::Ping);
        assert_eq!(parse("debug TOGGLE"), Command::Debug(Some(FlagSwitch::Toggle)));
        assert_eq!(parse("trace"), Command::Trace(None));
    }

    #[test]
    fn test_help_forms() {
        assert_eq!(parse("help"), Command::Help { module: None, action: None });
        assert_eq!(
            parse("help 'Voice Box' say"),
            Command::Help {
                module: Some("Voice Box".into()),
                action: Some("say".into())
            }
        );
    }

    #[test]
    fn test_call_arguments() {
        match parse(r#"call Net scan '{"subnet": "10.0.0.0/24"}'"#) {
            Command::Call { module, action, args } => {
                assert_eq!(module, "Net");
                assert_eq!(action, "scan");
                assert_eq!(args["subnet"], "10.0.0.0/24");
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse("call Voice say hello world") {
            Command::Call { args, .. } => {
                assert_eq!(args["raw"], "hello world");
                assert_eq!(args["args"], json!(["hello", "world"]));
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse("call Voice say") {
            Command::Call { args, .. } => assert!(args.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_requests() {
        assert_eq!(parse_err(""), ControlErrorKind::UnknownCommand);
        assert_eq!(parse_err("   "), ControlErrorKind::UnknownCommand);
        assert_eq!(parse_err("call OnlyModule"), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("call M a {\"broken\""), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("call M a [1, 2]"), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("debug sideways"), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("reload"), ControlErrorKind::BadArguments);
    }

    #[test]
    fn test_speak_keeps_text_verbatim() {
        assert_eq!(
            parse("speak  it's \"fine\",  really "),
            Command::Speak("it's \"fine\",  really".into())
        );
        assert_eq!(parse_err("speak"), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("SPEAK   "), ControlErrorKind::BadArguments);
    }

    #[test]
    fn test_phrase_type_and_mood() {
        assert_eq!(
            parse("phrase boot"),
            Command::Phrase {
                phrase_type: "boot".into(),
                mood: None
            }
        );
        assert_eq!(
            parse("phrase greeting cheerful"),
            Command::Phrase {
                phrase_type: "greeting".into(),
                mood: Some("cheerful".into())
            }
        );
        assert_eq!(parse_err("phrase"), ControlErrorKind::BadArguments);
        assert_eq!(parse_err("phrase a b c"), ControlErrorKind::BadArguments);
    }

    #[test]
    fn test_free_form_keeps_raw_line() {
        assert_eq!(
            parse("  what's the weather like? "),
            Command::FreeForm("what's the weather like?".into())
        );
    }

    #[test]
    fn test_response_lines() {
        let ok = ControlResponse::success(json!({"tick": 3})).with_text("tick 3");
        let line = ok.to_line();
        assert!(line.ends_with('\n'));
        let back: ControlResponse = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(back, ok);

        let failed: ControlResponse = Err(ControlError::unknown_module("Ghost")).into();
        let value: Value = serde_json::from_str(&failed.to_line()).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "UnknownModule");
        assert!(value.get("result").is_none());
    }
}
