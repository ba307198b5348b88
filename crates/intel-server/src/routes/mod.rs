pub mod entities;
pub mod events;
pub mod modules;
pub mod runs;
