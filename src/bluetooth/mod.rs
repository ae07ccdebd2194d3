pub mod gatt;
pub mod scanner;

pub use gatt::BleTransport;
pub use scanner::RuuviScanner;
