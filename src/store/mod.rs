//! Data store modules for Supabase integration

pub mod characters;
pub mod matches;
pub mod supabase;

pub use characters::CharacterStore;
pub use matches::MatchStore;
pub use supabase::SupabaseClient;
