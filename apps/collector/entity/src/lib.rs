pub mod anchor;
pub mod chat;
pub mod consume;
pub mod live;
pub mod system_setting;
pub mod user;

pub use anchor::Model as Anchor;
pub use chat::Model as Chat;
pub use consume::Model as Consume;
pub use live::Model as Live;
pub use system_setting::Model as SystemSetting;
pub use user::Model as User;
