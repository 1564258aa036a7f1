pub mod chat;
pub mod dexscreener;
pub mod postgres;
pub mod telegram;

pub use chat::{
    BotCommand, ChatInfo, ChatTransport, CommandScope, InboundEvent, MessageFormat,
    RecordingTransport, SentMessage,
};
pub use dexscreener::{chunk_by_chain, DexScreenerClient, MarketDataSource};
pub use postgres::PostgresStore;
pub use telegram::TelegramTransport;
