// Common test helpers for farfieldd daemon tests
//
// This module provides utilities for:
// - Building synthetic audio frames
// - User interaction in hardware-dependent tests
// - Test output formatting

#![allow(dead_code)]

use farfieldd::AudioFrame;
use std::io::{self, Write};

/// A frame loud enough for the energy detector to call speech.
pub fn loud_frame() -> AudioFrame {
    AudioFrame::new(
        (0..480)
            .map(|i| if i % 2 == 0 { 16000 } else { -16000 })
            .collect(),
    )
}

/// A near-silent frame.
pub fn quiet_frame() -> AudioFrame {
    AudioFrame::new(vec![10; 480])
}

/// A frame whose first sample tags it, for ordering assertions.
pub fn tagged_frame(tag: i16) -> AudioFrame {
    AudioFrame::new(vec![tag; 480])
}

/// Ask user to confirm an action
pub fn confirm_action(prompt: &str) -> bool {
    print!(
        "\n[CONFIRM] {}\nPress 'y' to confirm, any other key to skip: ",
        prompt
    );
    io::stdout().flush().unwrap();

    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    input.trim().to_lowercase() == "y"
}

/// Pause and wait for user to press Enter
pub fn wait_for_user(prompt: &str) {
    println!("\n[PAUSE] {}", prompt);
    print!("Press Enter to continue...");
    io::stdout().flush().unwrap();

    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();
}

/// Print a section header
pub fn print_header(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {}", title);
    println!("{}", "=".repeat(60));
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("\nℹ {}", message);
}
