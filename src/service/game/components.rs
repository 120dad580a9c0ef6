use serde::{Deserialize, Serialize};

/// Colors handed out to character tokens, in assignment order.
pub const PALETTE: [Color; 8] = [
    Color::new(228, 26, 28),
    Color::new(55, 126, 184),
    Color::new(77, 175, 74),
    Color::new(152, 78, 163),
    Color::new(255, 127, 0),
    Color::new(166, 86, 40),
    Color::new(247, 129, 191),
    Color::new(153, 153, 153),
];

/// Longest accepted text-token label, in characters.
pub const MAX_TEXT_CONTENTS_LENGTH: usize = 100;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Character,
    Floor,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenContents {
    Icon { icon_id: String },
    Text { text: String },
}

/// A placed piece covering the half-open block
/// `[start_x, end_x) x [start_y, end_y) x [start_z, end_z)`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Token {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub contents: TokenContents,
    pub start_x: i64,
    pub start_y: i64,
    pub start_z: i64,
    pub end_x: i64,
    pub end_y: i64,
    pub end_z: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_rgb: Option<Color>,
}

impl Token {
    /// Every unit cell the token occupies.
    pub fn cells(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        (self.start_x..self.end_x).flat_map(move |x| {
            (self.start_y..self.end_y)
                .flat_map(move |y| (self.start_z..self.end_z).map(move |z| (x, y, z)))
        })
    }

    pub fn is_well_formed(&self) -> bool {
        let has_cells = self.start_x < self.end_x
            && self.start_y < self.end_y
            && self.start_z < self.end_z;
        let text_ok = match &self.contents {
            TokenContents::Icon { .. } => true,
            TokenContents::Text { text } => text.chars().count() <= MAX_TEXT_CONTENTS_LENGTH,
        };
        has_cells && text_ok
    }
}

/// A transient point marker, auto-removed a few seconds after placement.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ping {
    pub id: String,
    pub x: i64,
    pub y: i64,
}

/// Anything that can live on a board. Tokens and pings share one wire array,
/// so this is untagged and discriminated by shape.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    Token(Token),
    Ping(Ping),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Token(token) => &token.id,
            Entity::Ping(ping) => &ping.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icon_token(id: &str) -> Token {
        Token {
            id: id.to_owned(),
            kind: TokenKind::Character,
            contents: TokenContents::Icon {
                icon_id: "sword".to_owned(),
            },
            start_x: 0,
            start_y: 0,
            start_z: 0,
            end_x: 1,
            end_y: 1,
            end_z: 1,
            color_rgb: None,
        }
    }

    #[test]
    fn cells_cover_the_half_open_block() {
        let mut token = icon_token("a");
        token.end_x = 2;
        token.end_y = 2;

        let cells: Vec<_> = token.cells().collect();
        assert_eq!(cells, vec![(0, 0, 0), (0, 1, 0), (1, 0, 0), (1, 1, 0)]);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut token = icon_token("a");
        token.end_x = -1;
        assert!(!token.is_well_formed());
    }

    #[test]
    fn overlong_text_is_rejected() {
        let mut token = icon_token("a");
        token.contents = TokenContents::Text {
            text: "x".repeat(MAX_TEXT_CONTENTS_LENGTH + 1),
        };
        assert!(!token.is_well_formed());
    }

    #[test]
    fn entities_deserialize_by_shape() {
        let entity: Entity =
            serde_json::from_str(r#"{"id": "p1", "x": 3, "y": 4}"#).expect("valid ping");
        assert!(matches!(entity, Entity::Ping(_)));

        let entity: Entity = serde_json::from_str(
            r#"{
                "id": "t1",
                "type": "floor",
                "contents": {"type": "text", "text": "lava"},
                "start_x": 0, "start_y": 0, "start_z": 0,
                "end_x": 1, "end_y": 1, "end_z": 1
            }"#,
        )
        .expect("valid token");
        match entity {
            Entity::Token(token) => {
                assert_eq!(token.kind, TokenKind::Floor);
                assert_eq!(token.color_rgb, None);
            }
            Entity::Ping(_) => panic!("parsed a token as a ping"),
        }
    }
}
