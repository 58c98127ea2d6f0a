// Application layer: interactive front ends built on the protocol engine.

pub mod netapp_cli;
