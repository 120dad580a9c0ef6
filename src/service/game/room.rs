use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;

use super::components::{Color, Entity, Ping, Token, TokenKind, PALETTE};

/// In-memory board state for one room: every placed entity in insertion
/// order, a cell-level position index over the tokens, and the pool of
/// colors not yet worn by a character token.
///
/// A `Room` is always derived from a stored entity snapshot and rebuilt
/// whenever the change feed delivers a newer one; it is never the source of
/// truth itself.
pub struct Room {
    entities: IndexMap<String, Entity>,
    positions: HashMap<(i64, i64, i64), String>,
    color_pool: VecDeque<Color>,
}

impl Room {
    pub fn new(entities: Vec<Entity>) -> Self {
        let mut room = Room {
            entities: IndexMap::new(),
            positions: HashMap::new(),
            color_pool: VecDeque::new(),
        };

        // The pool is seeded afterwards, so rebuilding from a snapshot never
        // hands out colors the snapshot didn't contain.
        for entity in entities {
            match entity {
                Entity::Token(token) => room.insert_token(token),
                Entity::Ping(ping) => room.place_ping(ping),
            }
        }

        let used: Vec<Color> = room
            .entities
            .values()
            .filter_map(|entity| match entity {
                Entity::Token(token) => token.color_rgb,
                Entity::Ping(_) => None,
            })
            .collect();
        room.color_pool = PALETTE
            .iter()
            .copied()
            .filter(|color| !used.contains(color))
            .collect();

        room
    }

    pub fn reset(&mut self, entities: Vec<Entity>) {
        *self = Room::new(entities);
    }

    /// True iff every unit cell of the token is unoccupied or occupied only
    /// by a prior version of the same token.
    pub fn is_valid_position(&self, token: &Token) -> bool {
        token
            .cells()
            .all(|cell| self.positions.get(&cell).map_or(true, |id| *id == token.id))
    }

    /// Inserts or replaces a token. Callers must have checked
    /// `is_valid_position` first. A character token without a color gets the
    /// first available one; the displaced version's color returns to the
    /// pool.
    pub fn upsert(&mut self, token: Token) {
        self.remove_entity(&token.id);
        self.insert_token(token);
    }

    /// Removes a token or ping. Returns false when no such entity exists.
    pub fn delete(&mut self, entity_id: &str) -> bool {
        self.remove_entity(entity_id)
    }

    pub fn place_ping(&mut self, ping: Ping) {
        self.entities.insert(ping.id.clone(), Entity::Ping(ping));
    }

    pub fn remove_ping(&mut self, ping_id: &str) {
        if matches!(self.entities.get(ping_id), Some(Entity::Ping(_))) {
            self.entities.shift_remove(ping_id);
        }
    }

    /// All current entities, oldest first.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities.values().cloned().collect()
    }

    fn insert_token(&mut self, mut token: Token) {
        if token.kind == TokenKind::Character && token.color_rgb.is_none() {
            token.color_rgb = self.color_pool.pop_front();
        }
        for cell in token.cells() {
            self.positions.insert(cell, token.id.clone());
        }
        self.entities.insert(token.id.clone(), Entity::Token(token));
    }

    fn remove_entity(&mut self, entity_id: &str) -> bool {
        match self.entities.shift_remove(entity_id) {
            Some(Entity::Token(token)) => {
                for cell in token.cells() {
                    self.positions.remove(&cell);
                }
                if let Some(color) = token.color_rgb {
                    self.color_pool.push_back(color);
                }
                true
            }
            Some(Entity::Ping(_)) => true,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::game::components::TokenContents;

    fn character(id: &str, start: (i64, i64, i64), end: (i64, i64, i64)) -> Token {
        Token {
            id: id.to_owned(),
            kind: TokenKind::Character,
            contents: TokenContents::Icon {
                icon_id: "shield".to_owned(),
            },
            start_x: start.0,
            start_y: start.1,
            start_z: start.2,
            end_x: end.0,
            end_y: end.1,
            end_z: end.2,
            color_rgb: None,
        }
    }

    fn token_colors(room: &Room) -> Vec<Option<Color>> {
        room.snapshot()
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Token(token) => Some(token.color_rgb),
                Entity::Ping(_) => None,
            })
            .collect()
    }

    #[test]
    fn overlapping_tokens_are_invalid() {
        let mut room = Room::new(Vec::new());
        room.upsert(character("a", (0, 0, 0), (2, 2, 1)));

        assert!(!room.is_valid_position(&character("b", (1, 1, 0), (2, 2, 1))));
        assert!(room.is_valid_position(&character("b", (2, 0, 0), (3, 1, 1))));
        // A token never collides with its own cells
        assert!(room.is_valid_position(&character("a", (1, 1, 0), (2, 2, 1))));
    }

    #[test]
    fn moving_a_token_clears_its_old_cells() {
        let mut room = Room::new(Vec::new());
        room.upsert(character("a", (0, 0, 0), (1, 1, 1)));
        room.upsert(character("a", (5, 5, 0), (6, 6, 1)));

        assert!(room.is_valid_position(&character("b", (0, 0, 0), (1, 1, 1))));
        assert!(!room.is_valid_position(&character("b", (5, 5, 0), (6, 6, 1))));
    }

    #[test]
    fn deleting_a_token_frees_its_cells() {
        let mut room = Room::new(Vec::new());
        room.upsert(character("a", (0, 0, 0), (1, 1, 1)));
        assert!(room.delete("a"));
        assert!(!room.delete("a"));

        assert!(room.is_valid_position(&character("b", (0, 0, 0), (1, 1, 1))));
    }

    #[test]
    fn released_colors_are_recycled() {
        let mut room = Room::new(Vec::new());
        for i in 0..PALETTE.len() as i64 {
            room.upsert(character(&format!("token{i}"), (i, i, 0), (i + 1, i + 1, 1)));
        }

        // The pool is empty, so the freed color is the only one on offer.
        room.delete("token0");
        room.upsert(character("fresh", (20, 20, 0), (21, 21, 1)));

        let colors = token_colors(&room);
        assert_eq!(colors.last(), Some(&Some(PALETTE[0])));
        assert!(colors.iter().all(|color| color.is_some()));
    }

    #[test]
    fn colors_are_distinct_until_the_pool_runs_dry() {
        let mut room = Room::new(Vec::new());
        for i in 0..PALETTE.len() as i64 + 2 {
            room.upsert(character(
                &format!("token{i}"),
                (i, i, 0),
                (i + 1, i + 1, 1),
            ));
        }

        let colors = token_colors(&room);
        let assigned: Vec<Color> = colors.iter().filter_map(|c| *c).collect();
        let distinct: HashSet<_> = assigned.iter().copied().collect();
        assert_eq!(assigned.len(), PALETTE.len());
        assert_eq!(distinct.len(), PALETTE.len());
        assert_eq!(colors.iter().filter(|c| c.is_none()).count(), 2);
    }

    #[test]
    fn rebuilding_from_a_snapshot_keeps_colors_out_of_the_pool() {
        let mut room = Room::new(Vec::new());
        room.upsert(character("a", (0, 0, 0), (1, 1, 1)));
        let snapshot = room.snapshot();

        let mut restored = Room::new(snapshot);
        restored.upsert(character("b", (1, 0, 0), (2, 1, 1)));

        let colors = token_colors(&restored);
        assert_eq!(colors, vec![Some(PALETTE[0]), Some(PALETTE[1])]);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut room = Room::new(Vec::new());
        room.upsert(character("a", (0, 0, 0), (1, 1, 1)));
        room.place_ping(Ping {
            id: "p".to_owned(),
            x: 9,
            y: 9,
        });
        room.upsert(character("b", (1, 0, 0), (2, 1, 1)));
        // Updating an existing token re-appends it
        room.upsert(character("a", (2, 0, 0), (3, 1, 1)));

        let ids: Vec<String> = room
            .snapshot()
            .iter()
            .map(|entity| entity.id().to_owned())
            .collect();
        assert_eq!(ids, vec!["p", "b", "a"]);
    }
}
