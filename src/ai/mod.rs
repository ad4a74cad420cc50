pub mod speech;
pub mod vision;

/// Outcome of a remote inference call, decoded at the call boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success(String),
    Failure(String),
}

impl Completion {
    /// Text content of the first choice, if the service returned any.
    pub fn from_content(content: Option<String>) -> Self {
        match content {
            Some(text) if !text.trim().is_empty() => Self::Success(text),
            Some(_) => Self::Failure("response content was empty".to_owned()),
            None => Self::Failure("no content in response".to_owned()),
        }
    }
}
