// Structured-output extraction from streamed model text

pub mod extractor;
pub mod filtering_sink;
pub mod parse;

pub use extractor::{Extractor, ExtractorSession};
pub use filtering_sink::{FilteringOptions, FilteringSink, MalformedPolicy};
pub use parse::{parse_yaml_value, strip_code_fence, DebounceConfig, DebouncedYaml, ParseError};
