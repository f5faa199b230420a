/*!
 * Entity handlers.
 *
 * A device handler owns one full device address; a group handler owns one
 * group id. The [`Dispatcher`](crate::dispatcher::Dispatcher) routes decoded
 * router messages to them by exact address or group id. Handlers issue their
 * own queries through a [`CommandSender`] and publish what they learn as
 * [`EntityEvent`]s.
 */
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::address::Address;
use crate::command::{Command, CommandType, MessageType, ParameterType};
use crate::error::{HelvarError, Result};
use crate::scene::{
    decode_last_scene_in_block, decode_last_scene_in_group, decode_load_level, SceneLevel,
    SceneLevelTable, SceneRef, SCENES_PER_BLOCK,
};
use crate::session::CommandSender;

/// Fade time sent with level and scene commands, in 1/100 s
pub const DEFAULT_FADE_TIME: u32 = 50;

/// Highest group id the router accepts
pub const MAX_GROUP_ID: u16 = 16383;

/// Something a handler learned from the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityEvent {
    /// A device reported a new level (percent)
    LevelChanged {
        /// Device address
        address: Address,
        /// Level in percent
        level: f64,
    },
    /// A device answered a state query
    DeviceOnline {
        /// Device address
        address: Address,
    },
    /// A device's scene table was refreshed
    SceneTableUpdated {
        /// Device address
        address: Address,
    },
    /// A group's current scene changed
    SceneChanged {
        /// Group id
        group_id: u16,
        /// The active scene
        scene: SceneRef,
    },
    /// A group's member list was refreshed
    MembersChanged {
        /// Group id
        group_id: u16,
        /// Member device addresses
        members: Vec<Address>,
    },
}

/// Handler bound to one device address
pub trait DeviceHandler: Send + Sync {
    /// Full device address this handler owns
    fn address(&self) -> Address;

    /// Handle a message routed to this device
    fn handle_router_message(&self, command: &Command);

    /// A group this device belongs to recalled a scene
    fn apply_scene(&self, _scene: SceneRef) {}
}

/// Handler bound to one group id
pub trait GroupHandler: Send + Sync {
    /// Group id this handler owns
    fn group_id(&self) -> u16;

    /// Handle a message routed to this group
    fn handle_router_message(&self, command: &Command);

    /// Device addresses known to belong to the group
    fn members(&self) -> Vec<Address> {
        Vec::new()
    }

    /// Block used for recalls that carry no block of their own
    fn recall_block(&self) -> Option<u8> {
        None
    }
}

#[derive(Debug, Default)]
struct DimmerState {
    level: Option<f64>,
    online: bool,
    scene_levels: SceneLevelTable,
}

/// Single-channel dimmable device
pub struct Dimmer {
    address: Address,
    fade_time: u32,
    sender: CommandSender,
    state: RwLock<DimmerState>,
    events: broadcast::Sender<EntityEvent>,
}

impl fmt::Debug for Dimmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dimmer")
            .field("address", &self.address)
            .field("fade_time", &self.fade_time)
            .finish()
    }
}

impl Dimmer {
    /// Create a dimmer on `subnet`/`device` of the given router
    pub fn new(router: Address, subnet: u8, device: u8, sender: CommandSender) -> Result<Self> {
        let mut address = router.router_address();
        address.set_subnet(subnet);
        address.set_device(device);
        if !address.is_valid_for_device() {
            return Err(HelvarError::configuration(format!(
                "{} is not a valid device address",
                address
            )));
        }

        let (events, _) = broadcast::channel(100);
        debug!("Initializing dimmer {}", address);
        Ok(Self {
            address,
            fade_time: DEFAULT_FADE_TIME,
            sender,
            state: RwLock::new(DimmerState::default()),
            events,
        })
    }

    /// Use a different fade time
    pub fn with_fade_time(mut self, fade_time: u32) -> Self {
        self.fade_time = fade_time;
        self
    }

    /// Subscribe to events from this device
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    /// Query state, load level and scene table
    pub fn refresh(&self) {
        for command_type in [
            CommandType::QueryDeviceState,
            CommandType::QueryDeviceLoadLevel,
            CommandType::QuerySceneInfo,
        ] {
            self.sender.send(Command::new(command_type).with_address(self.address));
        }
    }

    /// Fade to a level in percent
    pub fn set_level(&self, level: u8) -> Result<()> {
        if level > 100 {
            return Err(HelvarError::configuration(format!(
                "level {} is outside 0-100",
                level
            )));
        }
        self.sender.send(
            Command::new(CommandType::DirectLevelDevice)
                .with_param(ParameterType::Level, level)
                .with_param(ParameterType::FadeTime, self.fade_time)
                .with_address(self.address),
        );
        Ok(())
    }

    /// Switch fully on or off
    pub fn switch(&self, on: bool) -> Result<()> {
        self.set_level(if on { 100 } else { 0 })
    }

    /// Last known level
    pub fn level(&self) -> Option<f64> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).level
    }

    /// True once the device has answered a state query
    pub fn is_online(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).online
    }

    /// Scene table entry
    pub fn scene_level(&self, scene: SceneRef) -> Option<SceneLevel> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scene_levels
            .get(scene.block, scene.scene)
    }

    fn update_level(&self, level: f64) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).level = Some(level);
        debug!("Dimmer {} level is now {}", self.address, level);
        let _ = self.events.send(EntityEvent::LevelChanged {
            address: self.address,
            level,
        });
    }

    fn handle_load_level(&self, command: &Command) {
        let Some(result) = command.result() else {
            warn!("Load level reply for {} has no value", self.address);
            return;
        };
        match decode_load_level(result) {
            Ok(level) => self.update_level(level),
            Err(e) => warn!("Ignoring load level for {}: {}", self.address, e),
        }
    }

    fn handle_state(&self) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).online = true;
        let _ = self.events.send(EntityEvent::DeviceOnline {
            address: self.address,
        });
    }

    fn handle_scene_info(&self, command: &Command) {
        let table = SceneLevelTable::from_reply(command.result().unwrap_or_default());
        self.state.write().unwrap_or_else(PoisonError::into_inner).scene_levels = table;
        debug!("Updated scene levels for {}", self.address);
        let _ = self.events.send(EntityEvent::SceneTableUpdated {
            address: self.address,
        });
    }
}

impl DeviceHandler for Dimmer {
    fn address(&self) -> Address {
        self.address
    }

    fn handle_router_message(&self, command: &Command) {
        if command.address() != Some(&self.address) {
            warn!(
                "Dimmer {} received a message for {:?}, ignoring",
                self.address,
                command.address()
            );
            return;
        }

        match (command.message_type(), command.command_type()) {
            (MessageType::Reply, CommandType::QueryDeviceLoadLevel) => self.handle_load_level(command),
            (MessageType::Reply, CommandType::QueryDeviceState) => self.handle_state(),
            (MessageType::Reply, CommandType::QuerySceneInfo) => self.handle_scene_info(command),
            (MessageType::Command, CommandType::DirectLevelDevice) => match command.level() {
                Ok(level) if level <= 100 => self.update_level(f64::from(level)),
                Ok(level) => warn!("Ignoring out of range level {} for {}", level, self.address),
                Err(e) => warn!("{}", e),
            },
            (_, other) => debug!("Dimmer {} does not handle {}", self.address, other),
        }
    }

    fn apply_scene(&self, scene: SceneRef) {
        match self.scene_level(scene) {
            Some(SceneLevel::Value(level)) => self.update_level(level),
            Some(level) => debug!("Dimmer {} keeps its level for {} ({:?})", self.address, scene, level),
            None => debug!("Dimmer {} has no entry for {}", self.address, scene),
        }
    }
}

#[derive(Debug)]
struct GroupState {
    block: u8,
    last_scene: Option<SceneRef>,
    members: Vec<Address>,
}

/// A group controlled through scene recalls
pub struct SceneGroup {
    group_id: u16,
    block: u8,
    fade_time: u32,
    sender: CommandSender,
    state: RwLock<GroupState>,
    events: broadcast::Sender<EntityEvent>,
}

impl fmt::Debug for SceneGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneGroup")
            .field("group_id", &self.group_id)
            .field("block", &self.block)
            .finish()
    }
}

impl SceneGroup {
    /// Create a handler for `group_id`, recalling scenes from `block`
    pub fn new(group_id: u16, block: u8, sender: CommandSender) -> Result<Self> {
        if !(1..=MAX_GROUP_ID).contains(&group_id) {
            return Err(HelvarError::configuration(format!(
                "group id {} outside 1-{}",
                group_id, MAX_GROUP_ID
            )));
        }
        SceneRef::new(block, 1)
            .map_err(|_| HelvarError::configuration(format!("block {} outside 1-8", block)))?;

        let (events, _) = broadcast::channel(100);
        debug!("Initializing group {} (block {})", group_id, block);
        Ok(Self {
            group_id,
            block,
            fade_time: DEFAULT_FADE_TIME,
            sender,
            state: RwLock::new(GroupState {
                block,
                last_scene: None,
                members: Vec::new(),
            }),
            events,
        })
    }

    /// Use a different fade time
    pub fn with_fade_time(mut self, fade_time: u32) -> Self {
        self.fade_time = fade_time;
        self
    }

    /// Subscribe to events from this group
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    /// Configured block
    pub fn block(&self) -> u8 {
        self.block
    }

    /// Last scene reported by the router
    pub fn last_scene(&self) -> Option<SceneRef> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).last_scene
    }

    /// Recall a scene of the configured block
    pub fn recall_scene(&self, scene: u8) -> Result<()> {
        if !(1..=SCENES_PER_BLOCK).contains(&scene) {
            return Err(HelvarError::configuration(format!(
                "scene {} outside 1-{}",
                scene, SCENES_PER_BLOCK
            )));
        }
        self.sender.send(
            Command::new(CommandType::RecallScene)
                .with_param(ParameterType::Group, self.group_id)
                .with_param(ParameterType::Block, self.block)
                .with_param(ParameterType::Scene, scene)
                .with_param(ParameterType::FadeTime, self.fade_time),
        );
        Ok(())
    }

    /// Ask for the last scene recalled in the configured block
    pub fn query_last_scene(&self) {
        self.sender.send(
            Command::new(CommandType::QueryLastSceneInBlock)
                .with_param(ParameterType::Group, self.group_id)
                .with_param(ParameterType::Block, self.block),
        );
    }

    /// Ask for the last scene recalled in any block
    pub fn query_last_scene_in_group(&self) {
        self.sender.send(
            Command::new(CommandType::QueryLastSceneInGroup)
                .with_param(ParameterType::Group, self.group_id),
        );
    }

    /// Ask for the member devices
    pub fn query_members(&self) {
        self.sender.send(
            Command::new(CommandType::QueryGroup).with_param(ParameterType::Group, self.group_id),
        );
    }

    fn update_scene(&self, scene: SceneRef) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.block = scene.block;
            state.last_scene = Some(scene);
        }
        debug!("Group {} is at {}", self.group_id, scene);
        let _ = self.events.send(EntityEvent::SceneChanged {
            group_id: self.group_id,
            scene,
        });
    }

    fn handle_recall(&self, command: &Command) {
        let block = command
            .block_id()
            .unwrap_or_else(|_| self.state.read().unwrap_or_else(PoisonError::into_inner).block);
        let scene = match command.scene_id() {
            Ok(scene) => scene,
            Err(e) => {
                warn!("Group {}: {}", self.group_id, e);
                return;
            }
        };
        match SceneRef::new(block, scene) {
            Ok(scene) => self.update_scene(scene),
            Err(e) => warn!("Group {} ignoring recall: {}", self.group_id, e),
        }
    }

    fn handle_last_scene(&self, command: &Command) {
        let Some(result) = command.result() else {
            warn!("Group {}: {} reply has no value", self.group_id, command.command_type());
            return;
        };
        let decoded = match command.command_type() {
            CommandType::QueryLastSceneInBlock => {
                let expected = command.block_id().unwrap_or(self.block);
                decode_last_scene_in_block(result, expected)
            }
            _ => decode_last_scene_in_group(result),
        };
        match decoded {
            Ok(scene) => self.update_scene(scene),
            Err(e) => warn!(
                "Group {} ignoring {} reply '{}': {}",
                self.group_id,
                command.command_type(),
                result,
                e
            ),
        }
    }

    fn handle_members(&self, command: &Command) {
        let members: Vec<Address> = command
            .result()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.parse::<Address>() {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!("Group {} member skipped: {}", self.group_id, e);
                    None
                }
            })
            .collect();

        debug!("Group {} has {} members", self.group_id, members.len());
        self.state.write().unwrap_or_else(PoisonError::into_inner).members = members.clone();
        let _ = self.events.send(EntityEvent::MembersChanged {
            group_id: self.group_id,
            members,
        });
    }
}

impl GroupHandler for SceneGroup {
    fn group_id(&self) -> u16 {
        self.group_id
    }

    fn handle_router_message(&self, command: &Command) {
        match command.group_id() {
            Ok(id) if id == self.group_id => {}
            _ => {
                warn!("Group {} received a message for another group, ignoring", self.group_id);
                return;
            }
        }

        match (command.message_type(), command.command_type()) {
            (MessageType::Command, CommandType::RecallScene) => self.handle_recall(command),
            (MessageType::Reply, CommandType::QueryLastSceneInBlock)
            | (MessageType::Reply, CommandType::QueryLastSceneInGroup) => self.handle_last_scene(command),
            (MessageType::Reply, CommandType::QueryGroup) => self.handle_members(command),
            (_, other) => debug!("Group {} does not handle {}", self.group_id, other),
        }
    }

    fn members(&self) -> Vec<Address> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).members.clone()
    }

    fn recall_block(&self) -> Option<u8> {
        Some(self.state.read().unwrap_or_else(PoisonError::into_inner).block)
    }
}
