use std::fmt::{Debug, Display, Formatter};

/// Identifies a session across both engines: the id of the engine that originated it (i.e. the
///  sender's engine) plus a session number that is unique for that engine while the session is alive
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId {
    pub originator_engine_id: u64,
    pub session_number: u64,
}

impl SessionId {
    pub fn new(originator_engine_id: u64, session_number: u64) -> SessionId {
        SessionId { originator_engine_id, session_number }
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S[{}:{:#x}]", self.originator_engine_id, self.session_number)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.originator_engine_id, self.session_number)
    }
}
