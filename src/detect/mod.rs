// Page classification: which supported site a URL belongs to.

pub mod platform;
