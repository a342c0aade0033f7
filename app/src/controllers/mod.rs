pub mod follow_ups;
pub mod health;
pub mod streams;

#[cfg(test)]
mod tests;
