pub mod appointment;
pub mod directory;
pub mod enums;
pub mod filters;
pub mod notification;
pub mod payment;
pub mod wallet;

pub use appointment::*;
pub use directory::*;
pub use filters::*;
pub use notification::*;
pub use payment::*;
pub use wallet::*;
