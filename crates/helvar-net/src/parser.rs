/*!
 * Decoder for received HelvarNet lines.
 *
 * Grammar: `<type>V:<digit>,C:<id>[,][params][@address][=result][#]`
 * where `params` runs up to the first `=`, `@` or `#`, `address` runs up to
 * the first `=` or `#`, and `result` runs up to `#` and may itself contain
 * `@` and `,` (member lists, `type@device` pairs). Address and result are
 * independently optional.
 *
 * Every failure is reported as [`HelvarError::UnsupportedCommand`] so the
 * reader can log it and move on to the next line.
 */
use std::str::FromStr;

use tracing::debug;

use crate::address::Address;
use crate::command::{Command, CommandParameter, CommandType, MessageType, ParameterType};
use crate::error::{HelvarError, Result};

/// Parse one received line into a [`Command`]
pub fn parse(line: &str) -> Result<Command> {
    let text = line.trim();
    let unsupported = |reason: &str| HelvarError::unsupported(format!("{} in '{}'", reason, text));

    let mut chars = text.chars();
    let message_type = chars
        .next()
        .and_then(MessageType::from_symbol)
        .ok_or_else(|| unsupported("unknown message type"))?;
    let rest = chars.as_str();

    let rest = rest
        .strip_prefix("V:")
        .ok_or_else(|| unsupported("missing version"))?;
    let mut rest_chars = rest.chars();
    let version = match rest_chars.next() {
        Some(c) if c.is_ascii_digit() => c.to_string(),
        _ => return Err(unsupported("malformed version")),
    };
    let rest = rest_chars
        .as_str()
        .strip_prefix(",C:")
        .ok_or_else(|| unsupported("missing command id"))?;

    let id_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if id_len == 0 {
        return Err(unsupported("malformed command id"));
    }
    let (id_text, rest) = rest.split_at(id_len);
    let command_type = id_text
        .parse::<u16>()
        .ok()
        .and_then(CommandType::from_id)
        .ok_or_else(|| unsupported(&format!("unknown command id {}", id_text)))?;

    let rest = rest.strip_prefix(',').unwrap_or(rest);

    let (params_text, rest) = take_until(rest, &['=', '@', '#']);
    let (address_text, rest) = match rest.strip_prefix('@') {
        Some(after) => {
            let (body, rest) = take_until(after, &['=', '#']);
            if body.is_empty() {
                return Err(unsupported("empty address"));
            }
            (Some(body), rest)
        }
        None => (None, rest),
    };
    let (result_text, rest) = match rest.strip_prefix('=') {
        Some(after) => {
            let (body, rest) = take_until(after, &['=', '#']);
            if body.is_empty() {
                return Err(unsupported("empty result"));
            }
            (Some(body), rest)
        }
        None => (None, rest),
    };
    let rest = rest.strip_prefix('#').unwrap_or(rest);
    if !rest.is_empty() {
        return Err(unsupported("trailing characters"));
    }

    let parameters = parse_parameters(params_text, text)?;
    let address = address_text
        .map(|body| {
            Address::from_str(body)
                .map_err(|e| unsupported(&format!("bad address ({})", e)))
        })
        .transpose()?;

    Ok(Command::decoded(
        message_type,
        command_type,
        version,
        parameters,
        address,
        result_text.map(str::to_string),
    ))
}

fn take_until<'a>(text: &'a str, stops: &[char]) -> (&'a str, &'a str) {
    match text.find(|c| stops.contains(&c)) {
        Some(index) => text.split_at(index),
        None => (text, ""),
    }
}

fn parse_parameters(params: &str, line: &str) -> Result<Vec<CommandParameter>> {
    let mut parameters = Vec::new();
    if params.is_empty() {
        return Ok(parameters);
    }
    for token in params.split(',') {
        let mut parts: Vec<&str> = token.split(':').collect();
        while parts.last().map_or(false, |p| p.is_empty()) {
            parts.pop();
        }
        let [tag, value] = parts.as_slice() else {
            debug!("Skipping malformed parameter '{}' in '{}'", token, line);
            continue;
        };
        let kind = ParameterType::from_tag(tag).ok_or_else(|| {
            HelvarError::unsupported(format!("unknown parameter tag '{}' in '{}'", tag, line))
        })?;
        parameters.push(CommandParameter::new(kind, value));
    }
    Ok(parameters)
}

impl FromStr for Command {
    type Err = HelvarError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_level_reply() {
        let command = parse("?V:1,C:152,@1.1.1.5=42#").unwrap();
        assert_eq!(command.message_type(), MessageType::Reply);
        assert_eq!(command.command_type(), CommandType::QueryDeviceLoadLevel);
        assert_eq!(command.version(), "1");
        assert_eq!(command.address(), Some(&Address::device_of(1, 1, 1, 5)));
        assert_eq!(command.result(), Some("42"));
        assert!(command.parameters().is_empty());
    }

    #[test]
    fn test_parse_garbage_is_unsupported() {
        for line in ["not a command", "", "#", ">V:x,C:11#", ">V:2,C:#", "?V:2,C:152=#"] {
            assert!(
                matches!(parse(line), Err(HelvarError::UnsupportedCommand(_))),
                "line {:?}",
                line
            );
        }
    }

    #[test]
    fn test_parse_unknown_command_id() {
        assert!(matches!(
            parse(">V:2,C:999,G:1#"),
            Err(HelvarError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn test_parse_unknown_parameter_tag() {
        assert!(matches!(
            parse(">V:2,C:11,X:1,@1.1#"),
            Err(HelvarError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn test_parse_broadcast_recall_scene() {
        let command = parse(">V:2,C:11,G:17,B:2,S:3,F:50#").unwrap();
        assert_eq!(command.message_type(), MessageType::Command);
        assert_eq!(command.command_type(), CommandType::RecallScene);
        assert_eq!(command.group_id().unwrap(), 17);
        assert_eq!(command.block_id().unwrap(), 2);
        assert_eq!(command.scene_id().unwrap(), 3);
        assert_eq!(command.param(ParameterType::FadeTime), Some("50"));
        assert!(command.address().is_none());
    }

    #[test]
    fn test_parse_params_address_and_result() {
        let command = parse("?V:2,C:103,G:4,B:1,@1.1=5#").unwrap();
        assert_eq!(command.group_id().unwrap(), 4);
        assert_eq!(command.block_id().unwrap(), 1);
        assert_eq!(command.address(), Some(&Address::router(1, 1)));
        assert_eq!(command.result(), Some("5"));
    }

    #[test]
    fn test_parse_result_may_contain_at_and_commas() {
        let command = parse("?V:2,C:100,@1.1.2=1537@1,1537@2,257@7#").unwrap();
        assert_eq!(command.address(), Some(&Address::subnet_of(1, 1, 2)));
        assert_eq!(command.result(), Some("1537@1,1537@2,257@7"));

        let command = parse("?V:2,C:164,G:3=@1.1.1.1,@1.1.1.2#").unwrap();
        assert_eq!(command.group_id().unwrap(), 3);
        assert!(command.address().is_none());
        assert_eq!(command.result(), Some("@1.1.1.1,@1.1.1.2"));
    }

    #[test]
    fn test_parse_without_terminator_or_with_newline() {
        let command = parse("?V:2,C:185=1700000000\r\n").unwrap();
        assert_eq!(command.command_type(), CommandType::QueryRouterTime);
        assert_eq!(command.result(), Some("1700000000"));
    }

    #[test]
    fn test_parse_skips_malformed_parameter_tokens() {
        let command = parse(">V:2,C:11,G:1,,B,S:2#").unwrap();
        assert_eq!(command.parameters().len(), 2);
        assert_eq!(command.scene_id().unwrap(), 2);
    }

    #[test]
    fn test_parse_bad_address_is_unsupported() {
        assert!(matches!(
            parse("?V:2,C:152,@1.a.1.5=42#"),
            Err(HelvarError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn test_serialized_command_parses_back() {
        let original = Command::new(CommandType::DirectLevelDevice)
            .with_param(ParameterType::Level, 80)
            .with_param(ParameterType::FadeTime, 50)
            .with_address(Address::device_of(1, 1, 3, 200));

        let decoded: Command = original.to_wire().parse().unwrap();
        assert_eq!(decoded.command_type(), original.command_type());
        assert_eq!(decoded.parameters(), original.parameters());
        assert_eq!(decoded.address(), original.address());
        assert_eq!(decoded, original);
    }
}
