//! Mirrored config classes with a flat entity index.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use perfkit_core::{
    composite_key, ConfigCategory, ConfigEntityDesc, ConfigEntityValue, NewConfigClass,
};

/// Leaf setting of a mirrored config class.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntity {
    /// Display name
    pub name: String,
    /// Class-local key
    pub config_key: u64,
    /// Key in the flat index
    pub composite_key: u64,
    /// Cached value
    pub value: Value,
    /// Description
    pub description: String,
    /// Constraints and presentation hints
    pub metadata: Value,
    /// Number of point updates applied since the class arrived
    pub update_count: u64,
}

/// Category of a mirrored config class.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigNode {
    /// Category name
    pub name: String,
    /// Nested categories
    pub subcategories: Vec<ConfigNode>,
    /// Leaf settings
    pub entities: Vec<ConfigEntity>,
}

impl ConfigNode {
    fn from_desc(class_name: &str, desc: ConfigCategory) -> Self {
        Self {
            name: desc.name,
            subcategories: desc
                .subcategories
                .into_iter()
                .map(|sub| Self::from_desc(class_name, sub))
                .collect(),
            entities: desc
                .entities
                .into_iter()
                .map(|e| ConfigEntity::from_desc(class_name, e))
                .collect(),
        }
    }

    /// Visit every entity together with its path, depth first.
    fn walk<F: FnMut(&[usize], usize, &ConfigEntity)>(&self, path: &mut Vec<usize>, f: &mut F) {
        for (i, entity) in self.entities.iter().enumerate() {
            f(path, i, entity);
        }
        for (i, sub) in self.subcategories.iter().enumerate() {
            path.push(i);
            sub.walk(path, f);
            path.pop();
        }
    }
}

impl ConfigEntity {
    fn from_desc(class_name: &str, desc: ConfigEntityDesc) -> Self {
        Self {
            composite_key: composite_key(class_name, desc.config_key),
            name: desc.name,
            config_key: desc.config_key,
            value: desc.value,
            description: desc.description,
            metadata: desc.metadata,
            update_count: 0,
        }
    }
}

/// One config class tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigClass {
    /// Class name
    pub name: String,
    /// Root category
    pub root: ConfigNode,
}

impl ConfigClass {
    /// Visit every entity of the class.
    pub fn for_each_entity<F: FnMut(&ConfigEntity)>(&self, mut f: F) {
        self.root.walk(&mut Vec::new(), &mut |_, _, e| f(e));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntityPath {
    class: String,
    categories: Vec<usize>,
    entity: usize,
}

/// Config classes keyed by name plus a composite-key index into them.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    classes: BTreeMap<String, ConfigClass>,
    index: HashMap<u64, EntityPath>,
    collisions: u64,
}

impl ConfigRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a class tree, replacing any class with the same name.
    ///
    /// Returns the number of entities indexed for the new tree.
    pub fn replace_class(&mut self, message: NewConfigClass) -> usize {
        let name = message.key;
        let declared = message.root.entity_count();

        if let Some(old) = self.classes.remove(&name) {
            let mut removed = 0;
            let index = &mut self.index;
            old.for_each_entity(|entity| {
                let owned = index
                    .get(&entity.composite_key)
                    .is_some_and(|path| path.class == name);
                if owned {
                    index.remove(&entity.composite_key);
                    removed += 1;
                }
            });
            debug!("Replacing config class: name={}, unindexed={}", name, removed);
        }

        let class = ConfigClass {
            name: name.clone(),
            root: ConfigNode::from_desc(&name, message.root),
        };

        let mut indexed = 0;
        let index = &mut self.index;
        let collisions = &mut self.collisions;
        class.root.walk(&mut Vec::new(), &mut |categories, entity_idx, entity| {
            if let Some(existing) = index.get(&entity.composite_key) {
                warn!(
                    "Config key collision: class={}, entity='{}', key={:#018x}, kept class={}",
                    name, entity.name, entity.composite_key, existing.class
                );
                *collisions += 1;
                return;
            }
            index.insert(
                entity.composite_key,
                EntityPath {
                    class: name.clone(),
                    categories: categories.to_vec(),
                    entity: entity_idx,
                },
            );
            indexed += 1;
        });

        if indexed < declared {
            warn!(
                "Config class '{}' indexed {} of {} entities",
                name, indexed, declared
            );
        } else {
            debug!("Installed config class: name={}, entities={}", name, indexed);
        }
        self.classes.insert(name, class);
        indexed
    }

    /// Apply one point update. Returns `false` for keys not in the index.
    pub fn apply_update(&mut self, update: &ConfigEntityValue) -> bool {
        let key = composite_key(&update.class_key, update.config_key);
        let Some(path) = self.index.get(&key) else {
            return false;
        };
        match resolve_mut(&mut self.classes, path) {
            Some(entity) => {
                entity.value = update.value.clone();
                entity.update_count += 1;
                true
            }
            None => false,
        }
    }

    /// Look up an entity by class name and class-local key.
    pub fn entity(&self, class_name: &str, config_key: u64) -> Option<&ConfigEntity> {
        self.entity_by_key(composite_key(class_name, config_key))
    }

    /// Look up an entity by composite key.
    pub fn entity_by_key(&self, key: u64) -> Option<&ConfigEntity> {
        let path = self.index.get(&key)?;
        let mut node = &self.classes.get(&path.class)?.root;
        for &i in &path.categories {
            node = node.subcategories.get(i)?;
        }
        node.entities.get(path.entity)
    }

    /// Class by name.
    pub fn class(&self, name: &str) -> Option<&ConfigClass> {
        self.classes.get(name)
    }

    /// All classes, sorted by name.
    pub fn classes(&self) -> impl Iterator<Item = &ConfigClass> {
        self.classes.values()
    }

    /// Number of classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of entries in the flat index.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Composite-key collisions seen since creation.
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Whether no classes are mirrored.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Drop every class and index entry.
    pub fn clear(&mut self) {
        self.classes.clear();
        self.index.clear();
    }
}

fn resolve_mut<'a>(
    classes: &'a mut BTreeMap<String, ConfigClass>,
    path: &EntityPath,
) -> Option<&'a mut ConfigEntity> {
    let mut node = &mut classes.get_mut(&path.class)?.root;
    for &i in &path.categories {
        node = node.subcategories.get_mut(i)?;
    }
    node.entities.get_mut(path.entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(name: &str, key: u64, value: Value) -> ConfigEntityDesc {
        ConfigEntityDesc {
            name: name.to_string(),
            config_key: key,
            value,
            description: String::new(),
            metadata: Value::Null,
        }
    }

    fn render_class() -> NewConfigClass {
        NewConfigClass {
            key: "render".to_string(),
            root: ConfigCategory {
                name: "render".to_string(),
                entities: vec![entity("vsync", 1, json!(true))],
                subcategories: vec![ConfigCategory {
                    name: "shadows".to_string(),
                    entities: vec![
                        entity("resolution", 2, json!(2048)),
                        entity("cascades", 3, json!(4)),
                    ],
                    subcategories: vec![],
                }],
            },
        }
    }

    #[test]
    fn test_replace_class_indexes_every_entity() {
        let mut registry = ConfigRegistry::new();
        assert_eq!(registry.replace_class(render_class()), 3);
        assert_eq!(registry.index_len(), 3);
        assert_eq!(registry.class_count(), 1);

        let cascades = registry.entity("render", 3).unwrap();
        assert_eq!(cascades.name, "cascades");
        assert_eq!(cascades.value, json!(4));
    }

    #[test]
    fn test_replace_class_rebuilds_index() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());

        let mut smaller = render_class();
        smaller.root.subcategories.clear();
        smaller.root.entities.push(entity("gamma", 9, json!(2.2)));
        assert_eq!(registry.replace_class(smaller), 2);

        assert_eq!(registry.index_len(), 2);
        assert!(registry.entity("render", 2).is_none());
        assert!(registry.entity("render", 9).is_some());
    }

    #[test]
    fn test_apply_update() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());

        let applied = registry.apply_update(&ConfigEntityValue {
            class_key: "render".to_string(),
            config_key: 2,
            value: json!(4096),
        });
        assert!(applied);

        let entity = registry.entity("render", 2).unwrap();
        assert_eq!(entity.value, json!(4096));
        assert_eq!(entity.update_count, 1);
    }

    #[test]
    fn test_apply_update_unknown_key() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());

        let applied = registry.apply_update(&ConfigEntityValue {
            class_key: "audio".to_string(),
            config_key: 2,
            value: json!(0),
        });
        assert!(!applied);
        assert_eq!(registry.entity("render", 2).unwrap().value, json!(2048));
    }

    #[test]
    fn test_collision_first_wins() {
        let mut registry = ConfigRegistry::new();
        let mut class = render_class();
        class.root.entities.push(entity("vsync_dup", 1, json!(false)));
        assert_eq!(class.root.entity_count(), 4);

        assert_eq!(registry.replace_class(class), 3);
        assert_eq!(registry.collisions(), 1);
        assert_eq!(registry.entity("render", 1).unwrap().name, "vsync");
    }

    #[test]
    fn test_replace_class_keeps_other_classes() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());
        registry.replace_class(NewConfigClass {
            key: "audio".to_string(),
            root: ConfigCategory {
                name: "audio".to_string(),
                entities: vec![entity("volume", 1, json!(0.8))],
                subcategories: vec![],
            },
        });
        assert_eq!(registry.index_len(), 4);

        registry.replace_class(render_class());
        assert_eq!(registry.index_len(), 4);
        assert_eq!(registry.entity("audio", 1).unwrap().value, json!(0.8));
    }

    #[test]
    fn test_clear() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.index_len(), 0);
    }

    #[test]
    fn test_for_each_entity_visits_tree() {
        let mut registry = ConfigRegistry::new();
        registry.replace_class(render_class());

        let mut names = Vec::new();
        registry
            .class("render")
            .unwrap()
            .for_each_entity(|e| names.push(e.name.clone()));
        assert_eq!(names, vec!["vsync", "resolution", "cascades"]);
    }
}
