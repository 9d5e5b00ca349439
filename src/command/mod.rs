//! Command envelopes sent to the device gateway
//!
//! HTTP bodies arrive as loose JSON. The builders here validate them and
//! produce a [`CommandEnvelope`] whose serialized form is exactly what goes
//! out on the command topic:
//!
//! ```json
//! {"command_id": "CMD00010", "command_name": "CONTROL_DEVICE",
//!  "device_type": "light", "node_id": "n7", "value": true}
//! ```
//!
//! Field presence follows JSON truthiness: `null`, `false`, `0` and `""`
//! count as missing for required identifiers, while "defined" only asks for
//! the key to exist.

pub mod telemetry;

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub use telemetry::Telemetry;

/// The three command families the gateway understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandName {
    ControlRule,
    Scenario,
    ControlDevice,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::ControlRule => "CONTROL_RULE",
            CommandName::Scenario => "SCENARIO",
            CommandName::ControlDevice => "CONTROL_DEVICE",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTROL_RULE" => Ok(CommandName::ControlRule),
            "SCENARIO" => Ok(CommandName::Scenario),
            "CONTROL_DEVICE" => Ok(CommandName::ControlDevice),
            _ => Err(BridgeError::InvalidCommandName),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Add,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScenarioAction {
    Add,
    Run,
    Delete,
}

/// Variant-specific part of a command, flattened into the envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandPayload {
    ControlRule {
        #[serde(rename = "type")]
        action: RuleAction,
        value: Value,
    },
    Scenario {
        #[serde(rename = "type")]
        action: ScenarioAction,
        value: Value,
    },
    ControlDevice {
        device_type: Value,
        node_id: Value,
        value: Value,
    },
}

/// A validated command ready to publish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub command_name: CommandName,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

/// Fields a rule needs before the gateway will accept it
const CONTROL_RULE_REQUIRED: [&str; 5] = [
    "device_type_if",
    "node_id_if",
    "comparator_if",
    "device_type",
    "node_id",
];

/// JSON truthiness: null, false, 0, NaN and "" are absent
pub fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn action_str(action: Option<&Value>) -> Option<&str> {
    action.and_then(Value::as_str)
}

/// Validate a CONTROL_RULE body
///
/// `ADD` echoes the rule unchanged once every condition and target field is
/// present; `DELETE` always succeeds with a null value.
pub fn build_control_rule(
    action: Option<&Value>,
    value: Option<&Value>,
) -> Result<CommandPayload, BridgeError> {
    match action_str(action) {
        Some("ADD") => {
            let rule = value
                .and_then(Value::as_object)
                .ok_or(BridgeError::InvalidPayload(CommandName::ControlRule))?;

            let complete = CONTROL_RULE_REQUIRED
                .iter()
                .all(|field| is_present(rule.get(*field)))
                && rule.contains_key("value_if");
            if !complete {
                return Err(BridgeError::InvalidPayload(CommandName::ControlRule));
            }

            Ok(CommandPayload::ControlRule {
                action: RuleAction::Add,
                value: Value::Object(rule.clone()),
            })
        }
        Some("DELETE") => Ok(CommandPayload::ControlRule {
            action: RuleAction::Delete,
            value: Value::Null,
        }),
        _ => Err(BridgeError::InvalidCommandType),
    }
}

/// Validate a SCENARIO body; `ADD` needs a non-empty list of steps
pub fn build_scenario(
    action: Option<&Value>,
    value: Option<&Value>,
) -> Result<CommandPayload, BridgeError> {
    let action = match action_str(action) {
        Some("ADD") => {
            return match value {
                Some(Value::Array(steps)) if !steps.is_empty() => Ok(CommandPayload::Scenario {
                    action: ScenarioAction::Add,
                    value: Value::Array(steps.clone()),
                }),
                _ => Err(BridgeError::InvalidPayload(CommandName::Scenario)),
            };
        }
        Some("RUN") => ScenarioAction::Run,
        Some("DELETE") => ScenarioAction::Delete,
        _ => return Err(BridgeError::InvalidCommandType),
    };

    Ok(CommandPayload::Scenario {
        action,
        value: Value::Null,
    })
}

/// Validate a CONTROL_DEVICE body
///
/// `value` only has to be defined, so `false`, `0` and `""` are valid
/// device states.
pub fn build_control_device(
    device_type: Option<&Value>,
    node_id: Option<&Value>,
    value: Option<&Value>,
) -> Result<CommandPayload, BridgeError> {
    match (device_type, node_id, value) {
        (Some(device_type), Some(node_id), Some(value))
            if is_present(Some(device_type)) && is_present(Some(node_id)) =>
        {
            Ok(CommandPayload::ControlDevice {
                device_type: device_type.clone(),
                node_id: node_id.clone(),
                value: value.clone(),
            })
        }
        _ => Err(BridgeError::InvalidPayload(CommandName::ControlDevice)),
    }
}

/// Build a command envelope from a raw request body
pub fn build_command(body: &Value) -> Result<CommandEnvelope, BridgeError> {
    let empty = Map::new();
    let fields = body.as_object().unwrap_or(&empty);

    let command_id = fields.get("command_id");
    let command_name = fields.get("command_name");
    if !is_present(command_id) || !is_present(command_name) {
        return Err(BridgeError::MissingRequiredFields);
    }

    let command_id = match command_id {
        Some(Value::String(id)) => id.clone(),
        _ => return Err(BridgeError::InvalidCommandId),
    };
    let command_name: CommandName = command_name
        .and_then(Value::as_str)
        .ok_or(BridgeError::InvalidCommandName)?
        .parse()?;

    let payload = match command_name {
        CommandName::ControlRule => build_control_rule(fields.get("type"), fields.get("value"))?,
        CommandName::Scenario => build_scenario(fields.get("type"), fields.get("value"))?,
        CommandName::ControlDevice => build_control_device(
            fields.get("device_type"),
            fields.get("node_id"),
            fields.get("value"),
        )?,
    };

    Ok(CommandEnvelope {
        command_id,
        command_name,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn full_rule() -> Value {
        json!({
            "device_type_if": "sensor",
            "node_id_if": "n1",
            "comparator_if": ">",
            "value_if": 30,
            "device_type": "fan",
            "node_id": "n2",
            "value": true
        })
    }

    #[test]
    fn test_is_present_truthiness() {
        assert!(!is_present(None));
        assert!(!is_present(Some(&Value::Null)));
        assert!(!is_present(Some(&json!(false))));
        assert!(!is_present(Some(&json!(0))));
        assert!(!is_present(Some(&json!(0.0))));
        assert!(!is_present(Some(&json!(""))));

        assert!(is_present(Some(&json!(true))));
        assert!(is_present(Some(&json!(-1))));
        assert!(is_present(Some(&json!("0"))));
        assert!(is_present(Some(&json!([]))));
        assert!(is_present(Some(&json!({}))));
    }

    #[test]
    fn test_control_rule_add_echoes_value() {
        let rule = full_rule();
        let payload = build_control_rule(Some(&json!("ADD")), Some(&rule)).unwrap();
        assert_eq!(
            payload,
            CommandPayload::ControlRule {
                action: RuleAction::Add,
                value: rule
            }
        );
    }

    #[test]
    fn test_control_rule_add_missing_any_required_field() {
        for field in CONTROL_RULE_REQUIRED.iter().chain(["value_if"].iter()) {
            let mut rule = full_rule();
            rule.as_object_mut().unwrap().remove(*field);

            let result = build_control_rule(Some(&json!("ADD")), Some(&rule));
            assert!(
                matches!(
                    result,
                    Err(BridgeError::InvalidPayload(CommandName::ControlRule))
                ),
                "removing {field} should invalidate the rule"
            );
        }
    }

    #[test]
    fn test_control_rule_value_if_only_needs_to_be_defined() {
        let mut rule = full_rule();
        rule["value_if"] = json!(0);
        assert!(build_control_rule(Some(&json!("ADD")), Some(&rule)).is_ok());

        rule["value_if"] = Value::Null;
        assert!(build_control_rule(Some(&json!("ADD")), Some(&rule)).is_ok());

        rule["node_id"] = json!("");
        assert!(build_control_rule(Some(&json!("ADD")), Some(&rule)).is_err());
    }

    #[test]
    fn test_control_rule_add_rejects_non_object() {
        for value in [None, Some(json!(null)), Some(json!("rule")), Some(json!([1]))] {
            let result = build_control_rule(Some(&json!("ADD")), value.as_ref());
            assert!(matches!(result, Err(BridgeError::InvalidPayload(_))));
        }
    }

    #[test]
    fn test_control_rule_delete_and_unknown_type() {
        let payload = build_control_rule(Some(&json!("DELETE")), Some(&full_rule())).unwrap();
        assert_eq!(
            payload,
            CommandPayload::ControlRule {
                action: RuleAction::Delete,
                value: Value::Null
            }
        );

        assert!(matches!(
            build_control_rule(Some(&json!("RUN")), None),
            Err(BridgeError::InvalidCommandType)
        ));
        assert!(matches!(
            build_control_rule(None, None),
            Err(BridgeError::InvalidCommandType)
        ));
        assert!(matches!(
            build_control_rule(Some(&json!("add")), Some(&full_rule())),
            Err(BridgeError::InvalidCommandType)
        ));
    }

    #[test]
    fn test_scenario_builder() {
        assert!(matches!(
            build_scenario(Some(&json!("ADD")), Some(&json!([]))),
            Err(BridgeError::InvalidPayload(CommandName::Scenario))
        ));
        assert!(matches!(
            build_scenario(Some(&json!("ADD")), None),
            Err(BridgeError::InvalidPayload(CommandName::Scenario))
        ));

        let step = json!({"node_id": "n1", "value": 1});
        assert_eq!(
            build_scenario(Some(&json!("ADD")), Some(&json!([step.clone()]))).unwrap(),
            CommandPayload::Scenario {
                action: ScenarioAction::Add,
                value: json!([step])
            }
        );

        for (action, expected) in [("RUN", ScenarioAction::Run), ("DELETE", ScenarioAction::Delete)] {
            assert_eq!(
                build_scenario(Some(&json!(action)), Some(&json!([1]))).unwrap(),
                CommandPayload::Scenario {
                    action: expected,
                    value: Value::Null
                }
            );
        }

        assert!(matches!(
            build_scenario(Some(&json!("PAUSE")), None),
            Err(BridgeError::InvalidCommandType)
        ));
    }

    #[test]
    fn test_control_device_builder() {
        let payload =
            build_control_device(Some(&json!("light")), Some(&json!("n7")), Some(&json!(false)))
                .unwrap();
        assert_eq!(
            payload,
            CommandPayload::ControlDevice {
                device_type: json!("light"),
                node_id: json!("n7"),
                value: json!(false)
            }
        );

        assert!(build_control_device(Some(&json!("light")), Some(&json!("n7")), None).is_err());
        assert!(
            build_control_device(Some(&json!("")), Some(&json!("n7")), Some(&json!(1))).is_err()
        );
        assert!(build_control_device(None, Some(&json!("n7")), Some(&json!(1))).is_err());
    }

    #[test]
    fn test_build_command_requires_envelope_fields() {
        for body in [
            json!({}),
            json!({"command_id": "CMD00010"}),
            json!({"command_name": "SCENARIO"}),
            json!({"command_id": "", "command_name": "SCENARIO"}),
            json!("not an object"),
        ] {
            assert!(
                matches!(build_command(&body), Err(BridgeError::MissingRequiredFields)),
                "{body} should be missing fields"
            );
        }
    }

    #[test]
    fn test_build_command_rejects_non_string_id() {
        for id in [json!(7), json!(true), json!({"id": 1}), json!(["CMD1"])] {
            let body = json!({"command_id": id, "command_name": "SCENARIO", "type": "DELETE"});
            let err = build_command(&body).err().unwrap();
            assert!(matches!(err, BridgeError::InvalidCommandId), "{body}");
            assert_eq!(err.user_message(), "Invalid command_id: must be a string.");
        }
    }

    #[test]
    fn test_build_command_unknown_name() {
        let result = build_command(&json!({"command_id": "CMD1", "command_name": "REBOOT"}));
        assert!(matches!(result, Err(BridgeError::InvalidCommandName)));

        let result = build_command(&json!({"command_id": "CMD1", "command_name": 42}));
        assert!(matches!(result, Err(BridgeError::InvalidCommandName)));
    }

    #[test]
    fn test_control_device_wire_form() {
        let envelope = build_command(&json!({
            "command_id": "CMD00010",
            "command_name": "CONTROL_DEVICE",
            "device_type": "light",
            "node_id": "n7",
            "value": true,
            "ignored": "extra"
        }))
        .unwrap();

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "command_id": "CMD00010",
                "command_name": "CONTROL_DEVICE",
                "device_type": "light",
                "node_id": "n7",
                "value": true
            })
        );
    }

    #[test]
    fn test_control_rule_wire_form() {
        let envelope = build_command(&json!({
            "command_id": "CMD00020",
            "command_name": "CONTROL_RULE",
            "type": "DELETE",
            "value": {"anything": 1}
        }))
        .unwrap();

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "command_id": "CMD00020",
                "command_name": "CONTROL_RULE",
                "type": "DELETE",
                "value": null
            })
        );
    }

    #[test]
    fn test_command_name_parsing() {
        assert_eq!("SCENARIO".parse::<CommandName>().unwrap(), CommandName::Scenario);
        assert!("scenario".parse::<CommandName>().is_err());
        assert_eq!(CommandName::ControlDevice.to_string(), "CONTROL_DEVICE");
    }

    proptest! {
        #[test]
        fn scenario_add_accepts_any_non_empty_list(steps in prop::collection::vec(any::<i64>(), 1..16)) {
            let value = json!(steps);
            let payload = build_scenario(Some(&json!("ADD")), Some(&value)).unwrap();
            prop_assert_eq!(payload, CommandPayload::Scenario { action: ScenarioAction::Add, value });
        }

        #[test]
        fn control_device_echoes_any_defined_value(
            node_id in "[a-z0-9]{1,12}",
            raw in prop_oneof![
                any::<bool>().prop_map(Value::from),
                any::<i32>().prop_map(Value::from),
                ".*".prop_map(Value::from),
            ]
        ) {
            let body = json!({
                "command_id": "CMD00010",
                "command_name": "CONTROL_DEVICE",
                "device_type": "relay",
                "node_id": node_id,
                "value": raw.clone(),
            });
            let envelope = build_command(&body).unwrap();
            prop_assert_eq!(serde_json::to_value(&envelope).unwrap()["value"].clone(), raw);
        }

        #[test]
        fn unknown_command_types_are_rejected(action in "[A-Z]{1,8}") {
            prop_assume!(!["ADD", "DELETE", "RUN"].contains(&action.as_str()));
            prop_assert!(matches!(
                build_control_rule(Some(&json!(action)), None),
                Err(BridgeError::InvalidCommandType)
            ));
            prop_assert!(matches!(
                build_scenario(Some(&json!(action)), None),
                Err(BridgeError::InvalidCommandType)
            ));
        }
    }
}
