pub mod config;
pub mod navigation;
pub mod onboarding;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;
