pub mod id_counters;
pub mod registrations;
pub mod resource_id_lists;
pub mod resources;
