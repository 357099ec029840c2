pub mod registry_v2;

pub use registry_v2::registry_v2_router;
