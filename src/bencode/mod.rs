mod decoder;
mod value;

pub use decoder::{decode, raw_dict_value};
pub use value::BencodeValue;
