//! Motor de reproducción: cola, sesión por guild, transcodificación y
//! monitor de inactividad.

pub mod idle;
pub mod queue;
pub mod session;
pub mod transcode;
