pub mod backup;
pub mod chat_events;
pub mod chat_room;
pub mod payload;
pub mod room_registry;
pub mod vector_clock;
