pub mod registry_v2;
