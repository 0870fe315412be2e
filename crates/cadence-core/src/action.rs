//! Player actions recorded locally before being committed on-chain

use std::fmt;

use serde::{Deserialize, Serialize};

/// Grid position in world coordinates
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    #[inline]
    pub const fn new(x: i64, y: i64) -> Self {
        Position { x, y }
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A discrete player intent for the current epoch
///
/// The avatar game uses `Enter`, `Move` and `Exit`; the empire game uses
/// `Acquire` and `SendFleet`. Order matters: a sequence of moves is the
/// path the avatar walks.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LocalAction {
    Enter {
        x: i64,
        y: i64,
    },
    Move {
        x: i64,
        y: i64,
    },
    Exit {
        x: i64,
        y: i64,
    },
    Acquire {
        location: Position,
    },
    #[serde(rename_all = "camelCase")]
    SendFleet {
        from: Position,
        to: Position,
        spaceships: u64,
    },
}

/// Action discriminant without payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ActionKind {
    Enter,
    Move,
    Exit,
    Acquire,
    SendFleet,
}

impl LocalAction {
    pub fn enter(position: Position) -> Self {
        LocalAction::Enter {
            x: position.x,
            y: position.y,
        }
    }

    pub fn move_to(position: Position) -> Self {
        LocalAction::Move {
            x: position.x,
            y: position.y,
        }
    }

    pub fn exit(position: Position) -> Self {
        LocalAction::Exit {
            x: position.x,
            y: position.y,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            LocalAction::Enter { .. } => ActionKind::Enter,
            LocalAction::Move { .. } => ActionKind::Move,
            LocalAction::Exit { .. } => ActionKind::Exit,
            LocalAction::Acquire { .. } => ActionKind::Acquire,
            LocalAction::SendFleet { .. } => ActionKind::SendFleet,
        }
    }

    /// Position the action ends at
    pub fn target(&self) -> Position {
        match *self {
            LocalAction::Enter { x, y } | LocalAction::Move { x, y } | LocalAction::Exit { x, y } => {
                Position::new(x, y)
            }
            LocalAction::Acquire { location } => location,
            LocalAction::SendFleet { to, .. } => to,
        }
    }

    #[inline]
    pub fn is_enter(&self) -> bool {
        self.kind() == ActionKind::Enter
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        self.kind() == ActionKind::Exit
    }
}
