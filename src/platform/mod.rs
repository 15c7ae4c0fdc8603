//! Platform abstraction: mount table enumeration and blocking stat calls.

pub mod mock;
pub mod mountinfo;
pub mod pal;
