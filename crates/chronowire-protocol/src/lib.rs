//! Wire format spoken between the chronowire gateway and its WS clients.

pub mod frames;
pub mod methods;
pub mod params;
