//! The UI collaborator contract.
//!
//! Rendering is out of scope for the engine; the client calls through
//! this trait and the binary decides how to draw.

use crate::user::User;

/// Everything the client engine tells a front end.
pub trait ClientUi: Send {
    /// A chat line arrived (already formatted by the server).
    fn chat_line(&mut self, line: &str);

    /// The online user list changed.
    fn user_list(&mut self, users: &[User]);

    /// A modal text to show: private message, server message, news.
    fn modal(&mut self, title: &str, body: &str);

    /// The server's agreement text. Return true to accept; declining
    /// disconnects.
    fn agreement(&mut self, text: &str) -> bool;
}

/// A UI that accepts everything and renders nothing. Useful for tests
/// and headless tooling.
#[derive(Default)]
pub struct NullUi;

impl ClientUi for NullUi {
    fn chat_line(&mut self, _line: &str) {}
    fn user_list(&mut self, _users: &[User]) {}
    fn modal(&mut self, _title: &str, _body: &str) {}
    fn agreement(&mut self, _text: &str) -> bool {
        true
    }
}
