pub mod dwc;
pub mod ty;
