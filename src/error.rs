//! Error types for every component. Each one gets its own `thiserror`
//! enum, following `engine::types::EngineError`; nothing here is
//! meant to escape to a caller that would crash the event loop (§7).

use thiserror::Error;

/// The Rules Adapter never actually returns this — `BoardPosition::is_legal`
/// treats every parse failure as "not legal" rather than surfacing an
/// error (§4.1). Kept only so the adapter's error boundary is as
/// complete as every other component's.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("malformed UCI move string: {0}")]
    MalformedUci(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error spawning engine process: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine did not complete its UCI handshake in time")]
    InitTimeout,

    #[error("engine produced a move that the rules adapter rejects: {0}")]
    IllegalUciFromEngine(String),

    #[error("engine pool has no handle available and a replacement could not be spawned")]
    NoReplacement,

    #[error("engine process exited unexpectedly")]
    ProcessExited,
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Client-protocol errors: malformed payload, wrong turn, duplicate
/// proposal, unauthorised response. Always recovered locally — see
/// `GameSession` and `Dispatcher`, which convert these into a text
/// notice to the offending session and never terminate a game over one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("game is already over")]
    GameTerminated,
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("move payload missing a move")]
    MissingMove,
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("a proposal is already pending")]
    ProposalPending,
    #[error("not authorised to respond to this proposal")]
    Unauthorised,
    #[error("not enough moves have been played to take back")]
    InsufficientMoves,
    #[error("session is not registered; send join first")]
    NotRegistered,
    #[error("session is already waiting or playing")]
    AlreadyQueued,
    #[error("session is not in a game")]
    NoActiveGame,
}
