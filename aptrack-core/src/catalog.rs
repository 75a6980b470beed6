//! Item and location name tables ("data package").
//!
//! Ids are only unique inside one game, so every lookup is scoped by game
//! name. A miss never fails: it renders as `Item {id}` / `Location {id}`.

use crate::types::{ItemId, LocationId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Name tables for one game.
#[derive(Debug, Clone, Default)]
pub struct GameCatalog {
    item_name_to_id: HashMap<String, ItemId>,
    location_name_to_id: HashMap<String, LocationId>,
    item_id_to_name: HashMap<ItemId, String>,
    location_id_to_name: HashMap<LocationId, String>,
}

impl GameCatalog {
    pub fn new(
        item_name_to_id: HashMap<String, ItemId>,
        location_name_to_id: HashMap<String, LocationId>,
    ) -> Self {
        let item_id_to_name = item_name_to_id
            .iter()
            .map(|(name, id)| (*id, name.clone()))
            .collect();
        let location_id_to_name = location_name_to_id
            .iter()
            .map(|(name, id)| (*id, name.clone()))
            .collect();
        Self {
            item_name_to_id,
            location_name_to_id,
            item_id_to_name,
            location_id_to_name,
        }
    }

    pub fn item_name(&self, id: ItemId) -> Option<&str> {
        self.item_id_to_name.get(&id).map(String::as_str)
    }

    pub fn location_name(&self, id: LocationId) -> Option<&str> {
        self.location_id_to_name.get(&id).map(String::as_str)
    }

    pub fn item_id(&self, name: &str) -> Option<ItemId> {
        self.item_name_to_id.get(name).copied()
    }

    pub fn location_id(&self, name: &str) -> Option<LocationId> {
        self.location_name_to_id.get(name).copied()
    }

    /// Number of locations the game defines (not the number in a seed).
    pub fn location_count(&self) -> usize {
        self.location_name_to_id.len()
    }
}

/// Wire shape of one entry in `DataPackage.data.games`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawGamePackage {
    item_name_to_id: HashMap<String, ItemId>,
    location_name_to_id: HashMap<String, LocationId>,
}

/// Catalog of every game in a room.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    games: HashMap<String, GameCatalog>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `games` object of a `DataPackage` payload.
    ///
    /// Games whose tables do not decode are skipped with a warning.
    pub fn from_games_json(games: &serde_json::Value) -> Self {
        let mut catalog = Catalog::new();
        let Some(map) = games.as_object() else {
            return catalog;
        };
        for (game, tables) in map {
            match serde_json::from_value::<RawGamePackage>(tables.clone()) {
                Ok(raw) => {
                    catalog.insert(
                        game.clone(),
                        GameCatalog::new(raw.item_name_to_id, raw.location_name_to_id),
                    );
                }
                Err(e) => {
                    tracing::warn!(game = %game, error = %e, "Skipping undecodable data package entry");
                }
            }
        }
        catalog
    }

    pub fn insert(&mut self, game: String, tables: GameCatalog) {
        self.games.insert(game, tables);
    }

    pub fn game(&self, game: &str) -> Option<&GameCatalog> {
        self.games.get(game)
    }

    pub fn games(&self) -> impl Iterator<Item = &str> {
        self.games.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Item name in `game`'s id space, or `Item {id}`.
    pub fn item_name(&self, game: &str, id: ItemId) -> String {
        self.game(game)
            .and_then(|g| g.item_name(id))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Item {}", id))
    }

    /// Location name in `game`'s id space, or `Location {id}`.
    pub fn location_name(&self, game: &str, id: LocationId) -> String {
        self.game(game)
            .and_then(|g| g.location_name(id))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Location {}", id))
    }
}

/// Catalogs per server, shared between listeners and queries.
///
/// Writers replace the whole catalog; readers clone the `Arc` and never see a
/// half-built table.
#[derive(Debug, Default)]
pub struct CatalogStore {
    inner: RwLock<HashMap<String, Arc<Catalog>>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog for a server (empty if none received yet).
    pub fn get(&self, server: &str) -> Arc<Catalog> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(server).cloned().unwrap_or_default()
    }

    pub fn replace(&self, server: &str, catalog: Catalog) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(server.to_string(), Arc::new(catalog));
    }

    pub fn remove(&self, server: &str) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(server);
    }
}
