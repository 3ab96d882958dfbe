pub mod identity;

pub use identity::SigningIdentity;
