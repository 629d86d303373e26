mod digest;
mod github;
mod properties;
mod support;
