// Domain layer: models, the CoS catalog and ports (interfaces).

pub mod cos;
pub mod model;
pub mod ports;
