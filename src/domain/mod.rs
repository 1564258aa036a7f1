pub mod token;
pub mod user;

pub use token::{
    short_symbol, ChainInfo, MarketQuote, TokenSnapshot, TrackedToken, TrackedTokenIndex,
};
pub use user::{parse_instant, ChainTokens, Tier, Tracking, User, UserId};
