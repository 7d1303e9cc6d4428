pub mod bands;
pub mod beat;
pub mod dsp;
pub mod features;
pub mod ingest;
pub mod pcm;
pub mod source;
pub mod spectrum;
