pub mod container;
pub mod reference;
pub mod route;
pub mod token;

pub use container::{Container, PortMapping};
pub use reference::{ImageReference, Reference};
pub use route::{Attachment, ExternalRoute, Route};
pub use token::Token;
