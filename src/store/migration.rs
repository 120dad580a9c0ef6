//! Conversion of the legacy persisted token shape (bare `icon_id` field)
//! into the current one (`contents` wrapper). Coordinates and color copy
//! verbatim.

use serde::Deserialize;

use crate::{
    game::components::{Color, Entity, Token, TokenContents, TokenKind},
    Result,
};

#[derive(Debug, Deserialize)]
pub struct LegacyToken {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub icon_id: String,
    pub start_x: i64,
    pub start_y: i64,
    pub start_z: i64,
    pub end_x: i64,
    pub end_y: i64,
    pub end_z: i64,
    pub color_rgb: Option<Color>,
}

pub fn upgrade_token(legacy: LegacyToken) -> Token {
    Token {
        id: legacy.id,
        kind: legacy.kind,
        contents: TokenContents::Icon {
            icon_id: legacy.icon_id,
        },
        start_x: legacy.start_x,
        start_y: legacy.start_y,
        start_z: legacy.start_z,
        end_x: legacy.end_x,
        end_y: legacy.end_y,
        end_z: legacy.end_z,
        color_rgb: legacy.color_rgb,
    }
}

/// Upgrades one stored room value. Returns None when the value is already
/// in the current shape, Some(entities) when anything was converted, and an
/// error when an element parses as neither shape.
pub fn upgrade_room(raw: &serde_json::Value) -> Result<Option<Vec<Entity>>> {
    let items = raw
        .as_array()
        .ok_or_else(|| crate::Error::bad_store("stored room value is not an array"))?;

    let mut entities = Vec::with_capacity(items.len());
    let mut converted = false;
    for item in items {
        match serde_json::from_value::<Entity>(item.clone()) {
            Ok(entity) => entities.push(entity),
            Err(_) => {
                let legacy: LegacyToken = serde_json::from_value(item.clone())?;
                entities.push(Entity::Token(upgrade_token(legacy)));
                converted = true;
            }
        }
    }

    Ok(converted.then_some(entities))
}
