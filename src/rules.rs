//! Thin capability layer over the chess rules library (§4.1). Mirrors
//! the FEN/UCI handling already done by `chess::process::EngineProcess`
//! and `engine::communication`, reduced to exactly the operations the
//! game-session state machine needs.
//!
//! `shakmaty::Chess` carries no move history of its own, so a
//! [`BoardPosition`] keeps a stack of positions (one per ply played)
//! alongside the UCI strings that produced them. `pop` discards the
//! top of both stacks, which gives takeback O(1) undo instead of
//! replaying from the start.

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{Chess, EnPassantMode, Move, Position as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    None,
    Checkmate,
    Stalemate,
    InsufficientMaterial,
}

/// Opaque board state handed around by the game session. Never
/// serialised to clients directly — all client-visible state travels
/// as structured events (see `transport`), not board dumps.
#[derive(Debug, Clone)]
pub struct BoardPosition {
    stack: Vec<Chess>,
    moves: Vec<String>,
}

impl BoardPosition {
    /// A fresh starting position.
    pub fn new_position() -> Self {
        Self {
            stack: vec![Chess::default()],
            moves: Vec::new(),
        }
    }

    fn current(&self) -> &Chess {
        self.stack
            .last()
            .expect("BoardPosition always holds at least the starting position")
    }

    fn parse_legal(&self, move_uci: &str) -> Option<Move> {
        let uci = UciMove::from_ascii(move_uci.as_bytes()).ok()?;
        uci.to_move(self.current()).ok()
    }

    /// Any string that doesn't parse, or doesn't name a legal move in
    /// the current position, is simply not legal — no error variant,
    /// per §4.1 ("rejected with a non-exception signal").
    pub fn is_legal(&self, move_uci: &str) -> bool {
        self.parse_legal(move_uci).is_some()
    }

    /// Apply `move_uci` if legal. Returns whether it was applied.
    pub fn apply(&mut self, move_uci: &str) -> bool {
        let Some(mv) = self.parse_legal(move_uci) else {
            return false;
        };
        let mut next = self.current().clone();
        next.play_unchecked(&mv);
        self.stack.push(next);
        self.moves.push(move_uci.to_string());
        true
    }

    /// Undo the most recent ply. No-op (returns `false`) at the
    /// starting position.
    pub fn pop(&mut self) -> bool {
        if self.stack.len() <= 1 {
            return false;
        }
        self.stack.pop();
        self.moves.pop();
        true
    }

    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    pub fn last_move_uci(&self) -> Option<&str> {
        self.moves.last().map(String::as_str)
    }

    /// The full move history from the starting position, in UCI form
    /// — the shape a UCI engine's `position startpos moves ...`
    /// command expects.
    pub fn uci_moves(&self) -> &[String] {
        &self.moves
    }

    pub fn terminal_state(&self) -> TerminalState {
        let pos = self.current();
        if pos.is_checkmate() {
            TerminalState::Checkmate
        } else if pos.is_stalemate() {
            TerminalState::Stalemate
        } else if pos.is_insufficient_material() {
            TerminalState::InsufficientMaterial
        } else {
            TerminalState::None
        }
    }

    /// FEN of the current position, for diagnostic logging only.
    pub fn board_fen(&self) -> String {
        Fen::from_position(self.current().clone(), EnPassantMode::Legal).to_string()
    }
}

impl Default for BoardPosition {
    fn default() -> Self {
        Self::new_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_position_accepts_e4() {
        let pos = BoardPosition::new_position();
        assert!(pos.is_legal("e2e4"));
        assert!(!pos.is_legal("e2e5"));
        assert!(!pos.is_legal("not-a-move"));
    }

    #[test]
    fn apply_and_pop_round_trips() {
        let mut pos = BoardPosition::new_position();
        assert!(pos.apply("e2e4"));
        assert_eq!(pos.move_count(), 1);
        assert_eq!(pos.last_move_uci(), Some("e2e4"));
        assert!(pos.pop());
        assert_eq!(pos.move_count(), 0);
        assert!(!pos.pop());
    }

    #[test]
    fn scholars_mate_is_checkmate() {
        let mut pos = BoardPosition::new_position();
        for mv in ["f2f3", "e7e5", "g2g4", "d8h4"] {
            assert!(pos.apply(mv), "{mv} should be legal");
        }
        assert_eq!(pos.terminal_state(), TerminalState::Checkmate);
    }

    #[test]
    fn illegal_move_is_rejected_without_mutation() {
        let mut pos = BoardPosition::new_position();
        assert!(!pos.apply("e2e5"));
        assert_eq!(pos.move_count(), 0);
    }
}
