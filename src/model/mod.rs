pub mod id;
pub mod question;
pub mod results;
pub mod survey;
