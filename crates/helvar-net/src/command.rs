/*!
 * Typed HelvarNet messages.
 *
 * A [`Command`] carries its message type, command type, protocol version,
 * explicit parameters, an optional address and, for inbound replies, the raw
 * result payload. Only [`MessageType::Command`] messages are ever serialized;
 * the other message types are receive-only.
 */
use std::fmt;

use helvar_core::config::DEFAULT_PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{HelvarError, Result};

/// Message direction/kind, encoded as the first character of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// `>` command (outbound, or broadcast by the router)
    Command,
    /// `<` internal command
    InternalCommand,
    /// `?` reply to a query
    Reply,
    /// `!` error reply
    Error,
}

impl MessageType {
    /// Wire character
    pub fn symbol(&self) -> char {
        match self {
            MessageType::Command => '>',
            MessageType::InternalCommand => '<',
            MessageType::Reply => '?',
            MessageType::Error => '!',
        }
    }

    /// Message type for a wire character
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '>' => Some(MessageType::Command),
            '<' => Some(MessageType::InternalCommand),
            '?' => Some(MessageType::Reply),
            '!' => Some(MessageType::Error),
            _ => None,
        }
    }
}

macro_rules! command_types {
    ($($(#[$doc:meta])* $variant:ident = $id:literal, $label:literal;)+) => {
        /// HelvarNet command, identified on the wire by its numeric id
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum CommandType {
            $($(#[$doc])* $variant,)+
        }

        impl CommandType {
            /// Every supported command
            pub const ALL: &'static [CommandType] = &[$(CommandType::$variant,)+];

            /// Numeric protocol id
            pub fn id(&self) -> u16 {
                match self {
                    $(CommandType::$variant => $id,)+
                }
            }

            /// Human readable label
            pub fn label(&self) -> &'static str {
                match self {
                    $(CommandType::$variant => $label,)+
                }
            }

            /// Command for a numeric protocol id
            pub fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(CommandType::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

command_types! {
    /// Recall a scene in a group
    RecallScene = 11, "Recall Scene";
    /// Set a group to a direct level
    DirectLevelGroup = 13, "Direct Level, Group";
    /// Set a device to a direct level
    DirectLevelDevice = 14, "Direct Level, Device";
    /// List `type@device` pairs on a subnet
    QueryDeviceTypesAndAddresses = 100, "Query Device Types and Addresses";
    /// List clusters
    QueryClusters = 101, "Query Clusters";
    /// Last scene recalled in a block of a group
    QueryLastSceneInBlock = 103, "Query Last Scene in Block";
    /// Name of a group
    QueryGroupDescription = 105, "Query Group Description";
    /// Name of a device
    QueryDescriptionDevice = 106, "Query Description Device";
    /// Last scene recalled in a group
    QueryLastSceneInGroup = 109, "Query Last Scene in Group";
    /// Device state flags
    QueryDeviceState = 110, "Query Device State";
    /// Device load level
    QueryDeviceLoadLevel = 152, "Query Device Load Level";
    /// Members of a group
    QueryGroup = 164, "Query Group";
    /// List of group ids
    QueryGroups = 165, "Query Groups";
    /// Names of scenes
    QuerySceneNames = 166, "Query Scene Names";
    /// Scene level table of a device
    QuerySceneInfo = 167, "Query Scene Info";
    /// Router clock, used as keepalive
    QueryRouterTime = 185, "Query Router Time";
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.id())
    }
}

/// Parameter tag
///
/// `Level` and `Latitude` share the tag `L`. Decoding always yields `Level`;
/// lookups compare tags, so reading `Latitude` from a command finds the same
/// parameter and the command type decides what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    /// `V` protocol version
    Version,
    /// `C` command id
    Command,
    /// `@` address
    Address,
    /// `G` group id
    Group,
    /// `S` scene id
    Scene,
    /// `B` block id
    Block,
    /// `F` fade time in 1/100 s
    FadeTime,
    /// `L` level
    Level,
    /// `P` proportion
    Proportion,
    /// `D` display screen
    DisplayScreen,
    /// `Q` sequence number
    SequenceNumber,
    /// `T` time
    Time,
    /// `A` acknowledgement
    Ack,
    /// `L` latitude
    Latitude,
    /// `E` longitude
    Longitude,
    /// `Z` time zone difference
    TimeZoneDifference,
    /// `Y` daylight saving time
    DaylightSavingTime,
    /// `K` constant light scene
    ConstantLightScene,
    /// `O` force store scene
    ForceStoreScene,
}

impl ParameterType {
    /// Wire tag
    pub fn tag(&self) -> &'static str {
        match self {
            ParameterType::Version => "V",
            ParameterType::Command => "C",
            ParameterType::Address => "@",
            ParameterType::Group => "G",
            ParameterType::Scene => "S",
            ParameterType::Block => "B",
            ParameterType::FadeTime => "F",
            ParameterType::Level | ParameterType::Latitude => "L",
            ParameterType::Proportion => "P",
            ParameterType::DisplayScreen => "D",
            ParameterType::SequenceNumber => "Q",
            ParameterType::Time => "T",
            ParameterType::Ack => "A",
            ParameterType::Longitude => "E",
            ParameterType::TimeZoneDifference => "Z",
            ParameterType::DaylightSavingTime => "Y",
            ParameterType::ConstantLightScene => "K",
            ParameterType::ForceStoreScene => "O",
        }
    }

    /// Parameter type for a tag; `L` resolves to [`ParameterType::Level`]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "V" => ParameterType::Version,
            "C" => ParameterType::Command,
            "@" => ParameterType::Address,
            "G" => ParameterType::Group,
            "S" => ParameterType::Scene,
            "B" => ParameterType::Block,
            "F" => ParameterType::FadeTime,
            "L" => ParameterType::Level,
            "P" => ParameterType::Proportion,
            "D" => ParameterType::DisplayScreen,
            "Q" => ParameterType::SequenceNumber,
            "T" => ParameterType::Time,
            "A" => ParameterType::Ack,
            "E" => ParameterType::Longitude,
            "Z" => ParameterType::TimeZoneDifference,
            "Y" => ParameterType::DaylightSavingTime,
            "K" => ParameterType::ConstantLightScene,
            "O" => ParameterType::ForceStoreScene,
            _ => return None,
        };
        Some(kind)
    }
}

/// A `TAG:value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParameter {
    /// Parameter type
    pub kind: ParameterType,
    /// Raw argument
    pub value: String,
}

impl CommandParameter {
    /// Create a parameter
    pub fn new(kind: ParameterType, value: impl ToString) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for CommandParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.tag(), self.value)
    }
}

/// A HelvarNet message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    message_type: MessageType,
    command_type: CommandType,
    version: String,
    parameters: Vec<CommandParameter>,
    address: Option<Address>,
    result: Option<String>,
}

impl Command {
    /// Outbound command using the default protocol version
    pub fn new(command_type: CommandType) -> Self {
        Self {
            message_type: MessageType::Command,
            command_type,
            version: DEFAULT_PROTOCOL_VERSION.to_string(),
            parameters: Vec::new(),
            address: None,
            result: None,
        }
    }

    /// Message as decoded from the wire
    pub fn decoded(
        message_type: MessageType,
        command_type: CommandType,
        version: String,
        parameters: Vec<CommandParameter>,
        address: Option<Address>,
        result: Option<String>,
    ) -> Self {
        Self {
            message_type,
            command_type,
            version,
            parameters,
            address,
            result,
        }
    }

    /// Append a parameter
    pub fn with_param(mut self, kind: ParameterType, value: impl ToString) -> Self {
        self.parameters.push(CommandParameter::new(kind, value));
        self
    }

    /// Set the target address
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Replace the protocol version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Command type
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Protocol version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Explicit parameters (version and command id excluded)
    pub fn parameters(&self) -> &[CommandParameter] {
        &self.parameters
    }

    /// Target or source address
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Raw reply payload
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    /// Value of the first parameter carrying the same tag as `kind`
    pub fn param(&self, kind: ParameterType) -> Option<&str> {
        let tag = kind.tag();
        self.parameters
            .iter()
            .find(|p| p.kind.tag() == tag)
            .map(|p| p.value.as_str())
    }

    fn numeric_param<T: std::str::FromStr>(&self, kind: ParameterType, name: &str) -> Result<T> {
        let value = self.param(kind).ok_or_else(|| {
            HelvarError::not_found(format!("{} in {}", name, self.command_type))
        })?;
        value.trim().parse().map_err(|_| {
            HelvarError::not_found(format!(
                "{} '{}' is not numeric in {}",
                name, value, self.command_type
            ))
        })
    }

    /// Group id (`G`)
    pub fn group_id(&self) -> Result<u16> {
        self.numeric_param(ParameterType::Group, "group id")
    }

    /// Block id (`B`)
    pub fn block_id(&self) -> Result<u8> {
        self.numeric_param(ParameterType::Block, "block id")
    }

    /// Scene id (`S`)
    pub fn scene_id(&self) -> Result<u8> {
        self.numeric_param(ParameterType::Scene, "scene id")
    }

    /// Level (`L`)
    pub fn level(&self) -> Result<u8> {
        self.numeric_param(ParameterType::Level, "level")
    }

    /// Serialize for transmission. Empty for anything but [`MessageType::Command`].
    pub fn to_wire(&self) -> String {
        if self.message_type != MessageType::Command {
            return String::new();
        }

        let mut line = format!(
            "{}{}:{},{}:{}",
            self.message_type.symbol(),
            ParameterType::Version.tag(),
            self.version,
            ParameterType::Command.tag(),
            self.command_type.id()
        );
        for parameter in &self.parameters {
            line.push(',');
            line.push_str(&parameter.to_string());
        }
        if let Some(address) = &self.address {
            line.push(',');
            line.push_str(&address.to_string());
        }
        line.push('#');
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.message_type.symbol(), self.command_type)?;
        for parameter in &self.parameters {
            write!(f, " {}", parameter)?;
        }
        if let Some(address) = &self.address {
            write!(f, " {}", address)?;
        }
        if let Some(result) = &self.result {
            write!(f, " = {}", result)?;
        }
        Ok(())
    }
}
