/*!
 * Scene tables and scene-related reply decoding.
 *
 * A router stores 8 blocks of 16 scenes per group plus 8 reserved slots, so a
 * device's scene table has 136 entries addressed as `(block-1)*16 + (scene-1)`.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HelvarError, Result};

/// Number of entries in a device scene table
pub const SCENE_LEVELS_COUNT: usize = 136;

/// Scenes per block
pub const SCENES_PER_BLOCK: u8 = 16;

/// Number of addressable blocks
pub const BLOCK_COUNT: u8 = 8;

/// Highest joint scene index reported by last-scene queries
pub const MAX_SCENE_INDEX: u16 = SCENES_PER_BLOCK as u16 * BLOCK_COUNT as u16;

/// Level a device takes when a scene is recalled
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum SceneLevel {
    /// The device does not take part in the scene (`*`)
    #[default]
    Ignore,
    /// The device returns to its previous level (`L`)
    LastLevel,
    /// Explicit percentage
    Value(f64),
}

/// Per-device scene table built from a `QUERY_SCENE_INFO` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLevelTable {
    levels: Vec<SceneLevel>,
}

impl Default for SceneLevelTable {
    fn default() -> Self {
        Self {
            levels: vec![SceneLevel::Ignore; SCENE_LEVELS_COUNT],
        }
    }
}

impl SceneLevelTable {
    /// Parse a comma-separated scene info result
    ///
    /// Entries that cannot be read keep their `Ignore` default.
    pub fn from_reply(result: &str) -> Self {
        let mut table = Self::default();
        let entries: Vec<&str> = result.split(',').map(str::trim).collect();
        if entries.len() != SCENE_LEVELS_COUNT {
            warn!(
                "Scene info has {} entries, expected {}",
                entries.len(),
                SCENE_LEVELS_COUNT
            );
        }

        for (index, entry) in entries.into_iter().take(SCENE_LEVELS_COUNT).enumerate() {
            table.levels[index] = match entry {
                "*" => SceneLevel::Ignore,
                "L" => SceneLevel::LastLevel,
                value => match decode_load_level(value) {
                    Ok(level) => SceneLevel::Value(level),
                    Err(_) => {
                        warn!("Unexpected scene level '{}' at position {}, ignoring", value, index);
                        continue;
                    }
                },
            };
        }
        table
    }

    /// Table index for a block and scene, both 1-based
    pub fn index(block: u8, scene: u8) -> Option<usize> {
        if !(1..=BLOCK_COUNT).contains(&block) || !(1..=SCENES_PER_BLOCK).contains(&scene) {
            return None;
        }
        Some((block as usize - 1) * SCENES_PER_BLOCK as usize + (scene as usize - 1))
    }

    /// Level for a block and scene
    pub fn get(&self, block: u8, scene: u8) -> Option<SceneLevel> {
        Self::index(block, scene).and_then(|i| self.levels.get(i).copied())
    }

    /// All entries
    pub fn levels(&self) -> &[SceneLevel] {
        &self.levels
    }
}

/// Parse a load level; anything above 100 is reported as off
pub fn decode_load_level(value: &str) -> Result<f64> {
    let level: f64 = value
        .trim()
        .parse()
        .map_err(|_| HelvarError::invalid_response(format!("load level '{}' is not numeric", value)))?;
    if !level.is_finite() || level < 0.0 {
        return Err(HelvarError::invalid_response(format!(
            "load level '{}' is out of range",
            value
        )));
    }
    Ok(if level > 100.0 { 0.0 } else { level })
}

/// A scene within a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneRef {
    /// Block id (1-8)
    pub block: u8,
    /// Scene id (1-16)
    pub scene: u8,
}

impl fmt::Display for SceneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} scene {}", self.block, self.scene)
    }
}

impl SceneRef {
    /// Build from the joint index `(block-1)*16 + scene`
    pub fn from_index(index: u16) -> Result<Self> {
        if !(1..=MAX_SCENE_INDEX).contains(&index) {
            return Err(HelvarError::invalid_response(format!(
                "scene index {} outside 1-{}",
                index, MAX_SCENE_INDEX
            )));
        }
        let zero_based = index - 1;
        let block = (zero_based / SCENES_PER_BLOCK as u16 + 1) as u8;
        let scene = (zero_based % SCENES_PER_BLOCK as u16 + 1) as u8;
        Self::new(block, scene)
    }

    /// Joint index of this scene
    pub fn index(&self) -> u16 {
        (self.block as u16 - 1) * SCENES_PER_BLOCK as u16 + self.scene as u16
    }

    /// Validated scene reference
    pub fn new(block: u8, scene: u8) -> Result<Self> {
        if !(1..=BLOCK_COUNT).contains(&block) {
            return Err(HelvarError::invalid_response(format!("block {} outside 1-8", block)));
        }
        if !(1..=SCENES_PER_BLOCK).contains(&scene) {
            return Err(HelvarError::invalid_response(format!("scene {} outside 1-16", scene)));
        }
        Ok(Self { block, scene })
    }
}

fn parse_index(result: &str) -> Result<u16> {
    result
        .trim()
        .parse()
        .map_err(|_| HelvarError::invalid_response(format!("last scene '{}' is not numeric", result)))
}

/// Decode a `QUERY_LAST_SCENE_IN_GROUP` result, which carries block and scene jointly
pub fn decode_last_scene_in_group(result: &str) -> Result<SceneRef> {
    SceneRef::from_index(parse_index(result)?)
}

/// Decode a `QUERY_LAST_SCENE_IN_BLOCK` result for the block the query was sent for
///
/// Values 1-16 are a scene within `expected_block`. Larger values carry the
/// block jointly and are rejected when it differs from `expected_block`.
pub fn decode_last_scene_in_block(result: &str, expected_block: u8) -> Result<SceneRef> {
    let index = parse_index(result)?;
    let decoded = SceneRef::from_index(index)?;
    if index <= SCENES_PER_BLOCK as u16 {
        return SceneRef::new(expected_block, decoded.scene);
    }
    if decoded.block != expected_block {
        return Err(HelvarError::invalid_response(format!(
            "last scene is in block {} but block {} was queried",
            decoded.block, expected_block
        )));
    }
    Ok(decoded)
}

/// A named scene reported by `QUERY_SCENE_NAMES`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    /// Group the scene belongs to
    pub group_id: u16,
    /// Block id
    pub block: u8,
    /// Scene id
    pub scene: u8,
    /// Display name
    pub name: String,
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}.{} {}", self.group_id, self.block, self.scene, self.name)
    }
}

impl Scene {
    /// Parse one `@group.block.scene:name` entry
    pub fn parse_entry(entry: &str) -> Result<Self> {
        let bad = || HelvarError::invalid_response(format!("malformed scene name entry '{}'", entry));

        let entry = entry.trim();
        let body = entry.strip_prefix('@').ok_or_else(bad)?;
        let (path, name) = body.split_once(':').ok_or_else(bad)?;
        let mut ids = path.split('.');
        let (Some(group), Some(block), Some(scene), None) = (ids.next(), ids.next(), ids.next(), ids.next())
        else {
            return Err(bad());
        };

        let group_id: u16 = group.parse().map_err(|_| bad())?;
        let block: u8 = block.parse().map_err(|_| bad())?;
        let scene: u8 = scene.parse().map_err(|_| bad())?;
        SceneRef::new(block, scene)?;

        Ok(Self {
            group_id,
            block,
            scene,
            name: name.to_string(),
        })
    }

    /// Parse a whole `QUERY_SCENE_NAMES` result, skipping malformed entries
    pub fn parse_list(result: &str) -> Vec<Self> {
        result
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| match Self::parse_entry(entry) {
                Ok(scene) => Some(scene),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_info(overrides: &[(usize, &str)]) -> String {
        let mut entries = vec!["*".to_string(); SCENE_LEVELS_COUNT];
        for (index, value) in overrides {
            entries[*index] = value.to_string();
        }
        entries.join(",")
    }

    #[test]
    fn test_scene_table_from_reply() {
        let reply = scene_info(&[(0, "75"), (1, "L"), (17, "150"), (135, "0")]);
        let table = SceneLevelTable::from_reply(&reply);

        assert_eq!(table.get(1, 1), Some(SceneLevel::Value(75.0)));
        assert_eq!(table.get(1, 2), Some(SceneLevel::LastLevel));
        assert_eq!(table.get(1, 3), Some(SceneLevel::Ignore));
        // block 2, scene 2 is over range and reads as off
        assert_eq!(table.get(2, 2), Some(SceneLevel::Value(0.0)));
        assert_eq!(table.levels()[135], SceneLevel::Value(0.0));
        assert_eq!(table.levels().len(), SCENE_LEVELS_COUNT);
    }

    #[test]
    fn test_scene_table_tolerates_short_and_bad_replies() {
        let table = SceneLevelTable::from_reply("10,bogus,L");
        assert_eq!(table.get(1, 1), Some(SceneLevel::Value(10.0)));
        assert_eq!(table.get(1, 2), Some(SceneLevel::Ignore));
        assert_eq!(table.get(1, 3), Some(SceneLevel::LastLevel));
        assert_eq!(table.get(8, 16), Some(SceneLevel::Ignore));
    }

    #[test]
    fn test_scene_table_index_bounds() {
        assert_eq!(SceneLevelTable::index(1, 1), Some(0));
        assert_eq!(SceneLevelTable::index(8, 16), Some(127));
        assert_eq!(SceneLevelTable::index(0, 1), None);
        assert_eq!(SceneLevelTable::index(9, 1), None);
        assert_eq!(SceneLevelTable::index(1, 17), None);
    }

    #[test]
    fn test_decode_load_level() {
        assert_eq!(decode_load_level("42").unwrap(), 42.0);
        assert_eq!(decode_load_level("150").unwrap(), 0.0);
        assert_eq!(decode_load_level("100").unwrap(), 100.0);
        assert!(decode_load_level("abc").is_err());
        assert!(decode_load_level("-5").is_err());
    }

    #[test]
    fn test_last_scene_in_group() {
        assert_eq!(
            decode_last_scene_in_group("17").unwrap(),
            SceneRef { block: 2, scene: 1 }
        );
        assert_eq!(
            decode_last_scene_in_group("1").unwrap(),
            SceneRef { block: 1, scene: 1 }
        );
        assert_eq!(
            decode_last_scene_in_group("128").unwrap(),
            SceneRef { block: 8, scene: 16 }
        );
        assert!(decode_last_scene_in_group("0").is_err());
        assert!(decode_last_scene_in_group("129").is_err());
        assert!(decode_last_scene_in_group("x").is_err());
    }

    #[test]
    fn test_last_scene_in_block() {
        assert_eq!(
            decode_last_scene_in_block("5", 3).unwrap(),
            SceneRef { block: 3, scene: 5 }
        );
        assert_eq!(
            decode_last_scene_in_block("35", 3).unwrap(),
            SceneRef { block: 3, scene: 3 }
        );
        assert!(decode_last_scene_in_block("17", 3).is_err());
        assert!(decode_last_scene_in_block("5", 9).is_err());
        assert!(decode_last_scene_in_block("200", 3).is_err());
    }

    #[test]
    fn test_scene_ref_index() {
        let scene = SceneRef { block: 2, scene: 1 };
        assert_eq!(scene.index(), 17);
        assert_eq!(SceneRef::from_index(scene.index()).unwrap(), scene);
    }

    #[test]
    fn test_scene_names() {
        let scenes = Scene::parse_list("@12.1.3:Morning,@12.2.1:Evening,junk,@1.9.1:Bad");
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].group_id, 12);
        assert_eq!(scenes[0].block, 1);
        assert_eq!(scenes[0].scene, 3);
        assert_eq!(scenes[0].name, "Morning");
        assert_eq!(scenes[1].to_string(), "@12.2.1 Evening");
    }

    #[test]
    fn test_scene_display_tells_groups_apart() {
        let scenes = Scene::parse_list("@3.1.1:Off,@4.1.1:Off");
        assert_eq!(scenes[0].to_string(), "@3.1.1 Off");
        assert_ne!(scenes[0].to_string(), scenes[1].to_string());
    }
}
