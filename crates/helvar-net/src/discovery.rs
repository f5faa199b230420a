/*!
 * Device and group discovery.
 *
 * The protocol has no request ids, so a scan is a chain of queries where
 * each reply triggers the next step:
 *
 * 1. `QUERY_DEVICE_TYPES_AND_ADDRESSES` for subnets 1-4 lists `type@device` pairs;
 * 2. `QUERY_DESCRIPTION_DEVICE` per device yields its name, after which the
 *    device is reported if its type is recognised;
 * 3. `QUERY_GROUPS` lists group ids;
 * 4. `QUERY_SCENE_NAMES` is sent once the group table is populated;
 * 5. `QUERY_GROUP_DESCRIPTION` per group yields its name and reports it.
 *
 * Replies arriving while no scan is active are ignored.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::address::{Address, BusType};
use crate::command::{Command, CommandType, ParameterType};
use crate::device_type::DeviceType;
use crate::handler::MAX_GROUP_ID;
use crate::scene::Scene;
use crate::session::CommandSender;

/// Subnets enumerated by a scan
pub const SUBNETS: std::ops::RangeInclusive<u8> = 1..=4;

/// A device listed by the router, waiting for its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    /// Full device address
    pub address: Address,
    /// Raw type code
    pub type_code: u32,
    /// Name, once known
    pub name: Option<String>,
    /// Resolved type, once known
    pub device_type: Option<DeviceType>,
}

/// A group listed by the router, waiting for its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundGroup {
    /// Group id
    pub group_id: u16,
    /// Name, once known
    pub name: Option<String>,
    /// Named scenes of the group
    pub scenes: Vec<Scene>,
}

/// A fully identified device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Full device address
    pub address: Address,
    /// Name configured on the router
    pub name: String,
    /// Device classification
    pub device_type: DeviceType,
    /// Raw type code
    pub type_code: u32,
    /// Bus the device sits on
    pub bus_type: Option<BusType>,
}

impl DiscoveredDevice {
    /// Stable identifier
    pub fn uid(&self) -> String {
        self.address.to_uid()
    }

    /// Flat property map for an external catalogue
    pub fn properties(&self) -> serde_json::Value {
        json!({
            "subnetId": self.address.subnet_id(),
            "deviceId": self.address.device_id(),
            "deviceTypeId": self.type_code,
            "deviceTypeName": self.device_type.description(),
            "helvarAddress": self.address.to_string(),
            "busType": self.bus_type.map(|bus| bus.name()),
            "helvarName": self.name,
        })
    }
}

/// A fully identified group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredGroup {
    /// Group id
    pub group_id: u16,
    /// Name configured on the router
    pub name: String,
    /// Named scenes of the group
    pub scenes: Vec<Scene>,
}

impl DiscoveredGroup {
    /// Flat property map for an external catalogue
    pub fn properties(&self) -> serde_json::Value {
        json!({
            "groupId": self.group_id.to_string(),
            "groupName": self.name,
            "scenes": self.scenes,
        })
    }
}

/// Events emitted by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    /// A device was identified
    Device(DiscoveredDevice),
    /// A group was identified
    Group(DiscoveredGroup),
}

/// Receives discovered entities
pub trait DiscoverySink: Send + Sync {
    /// A device was identified
    fn device_discovered(&self, device: DiscoveredDevice);

    /// A group was identified
    fn group_discovered(&self, group: DiscoveredGroup);
}

impl DiscoverySink for tokio::sync::mpsc::UnboundedSender<DiscoveryEvent> {
    fn device_discovered(&self, device: DiscoveredDevice) {
        if self.send(DiscoveryEvent::Device(device)).is_err() {
            debug!("Discovery receiver dropped");
        }
    }

    fn group_discovered(&self, group: DiscoveredGroup) {
        if self.send(DiscoveryEvent::Group(group)).is_err() {
            debug!("Discovery receiver dropped");
        }
    }
}

#[derive(Debug)]
struct ScanState {
    id: u64,
    devices: HashMap<Address, FoundDevice>,
    groups: BTreeMap<u16, FoundGroup>,
    timer: Option<JoinHandle<()>>,
}

enum Found {
    Device(DiscoveredDevice),
    Group(DiscoveredGroup),
}

/// Drives discovery scans against one router
pub struct DiscoveryCoordinator {
    router: Address,
    sender: CommandSender,
    sink: Arc<dyn DiscoverySink>,
    timeout: Option<Duration>,
    scan: Mutex<Option<ScanState>>,
    next_scan: AtomicU64,
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("router", &self.router)
            .field("active", &self.is_active())
            .finish()
    }
}

impl DiscoveryCoordinator {
    /// Create a coordinator for `router`
    pub fn new(
        router: Address,
        sender: CommandSender,
        sink: Arc<dyn DiscoverySink>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            router: router.router_address(),
            sender,
            sink,
            timeout,
            scan: Mutex::new(None),
            next_scan: AtomicU64::new(1),
        }
    }

    fn scan(&self) -> MutexGuard<'_, Option<ScanState>> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a scan is running
    pub fn is_active(&self) -> bool {
        self.scan().is_some()
    }

    /// Start a scan, discarding any scan in progress
    ///
    /// The scan timeout is only armed when called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let id = self.next_scan.fetch_add(1, Ordering::SeqCst);
        let timer = self.timeout.and_then(|timeout| {
            let Ok(runtime) = Handle::try_current() else {
                warn!("No tokio runtime, discovery scan will not time out");
                return None;
            };
            let weak: Weak<Self> = Arc::downgrade(self);
            Some(runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(coordinator) = weak.upgrade() {
                    info!("Discovery scan timed out after {:?}", timeout);
                    coordinator.stop_scan(id);
                }
            }))
        });

        let previous = self.scan().replace(ScanState {
            id,
            devices: HashMap::new(),
            groups: BTreeMap::new(),
            timer,
        });
        if let Some(timer) = previous.and_then(|scan| scan.timer) {
            timer.abort();
        }

        info!("Starting Helvar discovery scan on router {}", self.router);
        for subnet in SUBNETS {
            self.sender.send(
                Command::new(CommandType::QueryDeviceTypesAndAddresses)
                    .with_address(self.router.with_subnet(subnet)),
            );
        }
        self.sender
            .send(Command::new(CommandType::QueryGroups).with_address(self.router));
    }

    /// Stop the running scan and drop everything it collected
    pub fn stop(&self) {
        let scan = self.scan().take();
        if let Some(scan) = scan {
            info!("Stopping Helvar discovery scan");
            if let Some(timer) = scan.timer {
                timer.abort();
            }
        }
    }

    fn stop_scan(&self, id: u64) {
        let mut guard = self.scan();
        if guard.as_ref().map(|scan| scan.id) == Some(id) {
            *guard = None;
        }
    }

    /// Feed a discovery-phase reply. Ignored when no scan is active.
    pub fn handle_reply(&self, command: &Command) {
        let found = {
            let mut guard = self.scan();
            let Some(scan) = guard.as_mut() else {
                debug!("Discovery not active, ignoring {}", command);
                return;
            };

            match command.command_type() {
                CommandType::QueryDeviceTypesAndAddresses => {
                    self.found_devices(scan, command);
                    Vec::new()
                }
                CommandType::QueryDescriptionDevice => self.found_device_name(scan, command),
                CommandType::QueryGroups => {
                    self.found_groups(scan, command);
                    Vec::new()
                }
                CommandType::QuerySceneNames => {
                    self.found_scene_names(scan, command);
                    Vec::new()
                }
                CommandType::QueryGroupDescription => self.found_group_name(scan, command),
                other => {
                    debug!("{} is not a discovery reply", other);
                    Vec::new()
                }
            }
        };

        for entity in found {
            match entity {
                Found::Device(device) => {
                    info!("Discovered {} '{}' at {}", device.device_type, device.name, device.address);
                    self.sink.device_discovered(device);
                }
                Found::Group(group) => {
                    info!("Discovered group {} '{}'", group.group_id, group.name);
                    self.sink.group_discovered(group);
                }
            }
        }
    }

    fn on_router(&self, address: Option<&Address>) -> bool {
        match address {
            Some(address) if address.is_on_router(&self.router) => true,
            other => {
                debug!("Ignoring discovery reply from {:?}, expected router {}", other, self.router);
                false
            }
        }
    }

    fn found_devices(&self, scan: &mut ScanState, command: &Command) {
        if !self.on_router(command.address()) {
            return;
        }
        let Some(subnet) = command.address().and_then(Address::subnet_id).filter(|s| SUBNETS.contains(s))
        else {
            warn!("Device list without a valid subnet: {}", command);
            return;
        };

        let result = command.result().unwrap_or_default();
        let subnet_address = self.router.with_subnet(subnet);
        scan.devices
            .retain(|address, _| address.subnet_id() != Some(subnet));

        let mut listed = Vec::new();
        for entry in result.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parsed = entry
                .split_once('@')
                .and_then(|(code, device)| Some((code.parse::<u32>().ok()?, device.parse::<u8>().ok()?)));
            let Some((type_code, device)) = parsed else {
                warn!("Skipping malformed device entry '{}' on subnet {}", entry, subnet);
                continue;
            };

            let address = subnet_address.with_device(device);
            trace!("Found device {} with type code {:#06x}", address, type_code);
            scan.devices.insert(
                address,
                FoundDevice {
                    address,
                    type_code,
                    name: None,
                    device_type: None,
                },
            );
            listed.push(address);
        }

        debug!("Found {} devices on subnet {}", listed.len(), subnet);
        for address in listed {
            self.sender.send(
                Command::new(CommandType::QueryDescriptionDevice).with_address(address),
            );
        }
    }

    fn found_device_name(&self, scan: &mut ScanState, command: &Command) -> Vec<Found> {
        if !self.on_router(command.address()) {
            return Vec::new();
        }
        let Some(address) = command.address() else {
            return Vec::new();
        };
        let Some(found) = scan.devices.get_mut(address) else {
            debug!("No pending device at {}, ignoring name", address);
            return Vec::new();
        };

        let name = command.result().unwrap_or_default().to_string();
        trace!("Setting name of device {} to '{}'", address, name);
        found.name = Some(name.clone());

        let Some(device_type) = DeviceType::from_code(found.type_code) else {
            debug!(
                "Device '{}' at {} has unrecognised type code {:#06x}, ignoring",
                name, address, found.type_code
            );
            return Vec::new();
        };
        found.device_type = Some(device_type);

        vec![Found::Device(DiscoveredDevice {
            address: found.address,
            name,
            device_type,
            type_code: found.type_code,
            bus_type: found.address.bus_type(),
        })]
    }

    fn found_groups(&self, scan: &mut ScanState, command: &Command) {
        let result = command.result().unwrap_or_default().trim();
        if result.is_empty() {
            debug!("No groups defined on router {}", self.router);
            return;
        }

        scan.groups.clear();
        for entry in result.split(',').map(str::trim) {
            match entry.parse::<u16>() {
                Ok(group_id) if (1..=MAX_GROUP_ID).contains(&group_id) => {
                    scan.groups.insert(
                        group_id,
                        FoundGroup {
                            group_id,
                            name: None,
                            scenes: Vec::new(),
                        },
                    );
                }
                _ => warn!("Unexpected group id '{}' in {}", entry, command),
            }
        }
        debug!("Found {} groups on router {}", scan.groups.len(), self.router);

        if !scan.groups.is_empty() {
            self.sender
                .send(Command::new(CommandType::QuerySceneNames).with_address(self.router));
        }
    }

    fn found_scene_names(&self, scan: &mut ScanState, command: &Command) {
        let scenes = Scene::parse_list(command.result().unwrap_or_default());
        if scenes.is_empty() {
            debug!("No scene names defined on router {}", self.router);
        }
        for scene in scenes {
            match scan.groups.get_mut(&scene.group_id) {
                Some(group) => group.scenes.push(scene),
                None => trace!("Scene name for unknown group {}: {}", scene.group_id, scene),
            }
        }

        for group_id in scan.groups.keys() {
            self.sender.send(
                Command::new(CommandType::QueryGroupDescription)
                    .with_param(ParameterType::Group, *group_id),
            );
        }
    }

    fn found_group_name(&self, scan: &mut ScanState, command: &Command) -> Vec<Found> {
        let group_id = match command.group_id() {
            Ok(group_id) => group_id,
            Err(e) => {
                warn!("Group description without group: {}", e);
                return Vec::new();
            }
        };
        let Some(group) = scan.groups.get_mut(&group_id) else {
            debug!("No pending group {}, ignoring name", group_id);
            return Vec::new();
        };

        let name = command.result().unwrap_or_default().to_string();
        trace!("Setting name of group {} to '{}'", group_id, name);
        group.name = Some(name.clone());

        vec![Found::Group(DiscoveredGroup {
            group_id,
            name,
            scenes: group.scenes.clone(),
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::session::SendQueue;

    struct Fixture {
        coordinator: Arc<DiscoveryCoordinator>,
        queue: Arc<SendQueue>,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    }

    fn fixture(timeout: Option<Duration>) -> Fixture {
        let queue = Arc::new(SendQueue::new());
        let (tx, events) = mpsc::unbounded_channel::<DiscoveryEvent>();
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            Address::router(1, 1),
            CommandSender::new(queue.clone(), "2"),
            Arc::new(tx),
            timeout,
        ));
        Fixture {
            coordinator,
            queue,
            events,
        }
    }

    fn drain(queue: &SendQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_pop()).map(|c| c.to_wire()).collect()
    }

    fn reply(line: &str) -> Command {
        line.parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_queries_subnets_then_groups() {
        let f = fixture(None);
        f.coordinator.start();
        assert!(f.coordinator.is_active());
        assert_eq!(
            drain(&f.queue),
            vec![
                ">V:2,C:100,@1.1.1#",
                ">V:2,C:100,@1.1.2#",
                ">V:2,C:100,@1.1.3#",
                ">V:2,C:100,@1.1.4#",
                ">V:2,C:165,@1.1#",
            ]
        );
    }

    #[tokio::test]
    async fn test_device_phases() {
        let mut f = fixture(None);
        f.coordinator.start();
        drain(&f.queue);

        f.coordinator
            .handle_reply(&reply("?V:2,C:100,@1.1.2=1537@1,2050@7,junk#"));
        assert_eq!(
            drain(&f.queue),
            vec![">V:2,C:106,@1.1.2.1#", ">V:2,C:106,@1.1.2.7#"]
        );

        f.coordinator.handle_reply(&reply("?V:2,C:106,@1.1.2.1=Hall downlight#"));
        // unknown type code: named but never reported
        f.coordinator.handle_reply(&reply("?V:2,C:106,@1.1.2.7=Mystery#"));
        // another router
        f.coordinator.handle_reply(&reply("?V:2,C:106,@1.2.2.1=Elsewhere#"));

        match f.events.try_recv().unwrap() {
            DiscoveryEvent::Device(device) => {
                assert_eq!(device.address, Address::device_of(1, 1, 2, 1));
                assert_eq!(device.name, "Hall downlight");
                assert_eq!(device.device_type, DeviceType::DaliLedModule);
                assert_eq!(device.bus_type, Some(BusType::Dali));
                assert_eq!(device.uid(), "1-1-2-1");
                assert_eq!(device.properties()["deviceTypeName"], "LED lamps");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_phases() {
        let mut f = fixture(None);
        f.coordinator.start();
        drain(&f.queue);

        f.coordinator.handle_reply(&reply("?V:2,C:165,@1.1=3,12,0,x#"));
        // group descriptions wait for the scene names reply
        assert_eq!(drain(&f.queue), vec![">V:2,C:166,@1.1#"]);

        f.coordinator
            .handle_reply(&reply("?V:2,C:166,@1.1=@12.1.1:Morning,@12.1.2:Evening,@99.1.1:Orphan#"));
        assert_eq!(drain(&f.queue), vec![">V:2,C:105,G:3#", ">V:2,C:105,G:12#"]);

        f.coordinator.handle_reply(&reply("?V:2,C:105,G:12=Lobby#"));
        f.coordinator.handle_reply(&reply("?V:2,C:105,G:77=Unknown#"));

        match f.events.try_recv().unwrap() {
            DiscoveryEvent::Group(group) => {
                assert_eq!(group.group_id, 12);
                assert_eq!(group.name, "Lobby");
                assert_eq!(group.scenes.len(), 2);
                assert_eq!(group.scenes[1].name, "Evening");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_groups_ends_group_branch() {
        let f = fixture(None);
        f.coordinator.start();
        drain(&f.queue);

        f.coordinator.handle_reply(&Command::decoded(
            crate::command::MessageType::Reply,
            CommandType::QueryGroups,
            "2".to_string(),
            Vec::new(),
            Some(Address::router(1, 1)),
            None,
        ));
        assert!(drain(&f.queue).is_empty());
    }

    #[tokio::test]
    async fn test_replies_after_stop_are_ignored() {
        let mut f = fixture(None);
        f.coordinator.start();
        f.coordinator.handle_reply(&reply("?V:2,C:100,@1.1.1=1537@5#"));
        f.coordinator.handle_reply(&reply("?V:2,C:165,@1.1=4#"));
        drain(&f.queue);

        f.coordinator.stop();
        assert!(!f.coordinator.is_active());

        f.coordinator.handle_reply(&reply("?V:2,C:106,@1.1.1.5=Desk lamp#"));
        f.coordinator.handle_reply(&reply("?V:2,C:166,@1.1=@4.1.1:Bright#"));
        f.coordinator.handle_reply(&reply("?V:2,C:105,G:4=Office#"));

        assert!(f.events.try_recv().is_err());
        assert!(drain(&f.queue).is_empty());

        // a fresh scan does not resurrect stale records
        f.coordinator.start();
        drain(&f.queue);
        f.coordinator.handle_reply(&reply("?V:2,C:106,@1.1.1.5=Desk lamp#"));
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_times_out() {
        let f = fixture(Some(Duration::from_millis(20)));
        f.coordinator.start();
        assert!(f.coordinator.is_active());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!f.coordinator.is_active());
    }

    #[test]
    fn test_start_outside_runtime_scans_without_timeout() {
        let f = fixture(Some(Duration::from_millis(20)));
        f.coordinator.start();
        assert!(f.coordinator.is_active());
        assert_eq!(drain(&f.queue).len(), 5);

        f.coordinator.stop();
        assert!(!f.coordinator.is_active());
    }
}
