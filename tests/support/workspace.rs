#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clangaroo::config::Config;
use clangaroo::location::SymbolLocation;
use tempfile::TempDir;

use super::cli::CliRunner;

pub const HELLO_H: &str = r#"#pragma once
#include <string>

/**
 * A simple greeting class for testing
 */
class Hello {
public:
    /**
     * Constructor
     * @param name The name to greet
     */
    explicit Hello(const std::string& name);

    /**
     * Print a greeting message
     */
    void greet() const;

    /**
     * Get the name
     * @return The stored name
     */
    const std::string& getName() const;

private:
    std::string m_name;
};

/**
 * Add two numbers together
 * @param a First number
 * @param b Second number
 * @return Sum of a and b
 */
int add_numbers(int a, int b);
"#;

pub const HELLO_CPP: &str = r#"#include "hello.h"
#include <iostream>

Hello::Hello(const std::string& name) : m_name(name) {
}

void Hello::greet() const {
    std::cout << "Hello, " << m_name << "!" << std::endl;
}

const std::string& Hello::getName() const {
    return m_name;
}

int add_numbers(int a, int b) {
    return a + b;
}
"#;

pub const MAIN_CPP: &str = r#"#include "hello.h"
#include <iostream>

int main() {
    std::cout << "Starting test..." << std::endl;

    // Test class instantiation
    Hello hello("World");
    hello.greet();

    // Test function call
    int result = add_numbers(5, 3);
    std::cout << "Result: " << result << std::endl;

    return 0;
}
"#;

/// Builder for throwaway C++ projects.
pub struct TestProjectBuilder {
    files: BTreeMap<PathBuf, String>,
    compile_commands: bool,
}

impl Default for TestProjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestProjectBuilder {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            compile_commands: false,
        }
    }

    /// The hello.h / hello.cpp / main.cpp project.
    pub fn hello() -> Self {
        Self::new()
            .with_file("hello.h", HELLO_H)
            .with_file("hello.cpp", HELLO_CPP)
            .with_file("main.cpp", MAIN_CPP)
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, content: impl Into<String>) -> Self {
        self.files
            .insert(path.as_ref().to_path_buf(), content.into());
        self
    }

    /// Write a compile_commands.json covering every .cpp file.
    pub fn with_compile_commands(mut self) -> Self {
        self.compile_commands = true;
        self
    }

    pub fn build(self) -> Result<TestProject> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().canonicalize()?;

        for (path, content) in &self.files {
            let full_path = root.join(path);
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full_path, content)?;
        }

        if self.compile_commands {
            let entries: Vec<serde_json::Value> = self
                .files
                .keys()
                .filter(|p| p.extension().is_some_and(|e| e == "cpp"))
                .map(|p| {
                    serde_json::json!({
                        "directory": root,
                        "command": format!("c++ -std=c++17 -c {}", p.display()),
                        "file": root.join(p),
                    })
                })
                .collect();
            std::fs::write(
                root.join("compile_commands.json"),
                serde_json::to_string_pretty(&entries)?,
            )?;
        }

        Ok(TestProject {
            _temp_dir: temp_dir,
            root,
        })
    }
}

/// A test project with automatic cleanup
pub struct TestProject {
    _temp_dir: TempDir, // Dropped last, cleaning up the directory
    root: PathBuf,
}

impl TestProject {
    pub fn builder() -> TestProjectBuilder {
        TestProjectBuilder::new()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.root.join(file)
    }

    pub fn at(&self, file: impl AsRef<Path>, line: u32, column: u32) -> SymbolLocation {
        SymbolLocation::new(self.path(file), line, column).unwrap()
    }

    /// Service configuration with a private cache and no file watching.
    pub fn config(&self) -> Config {
        let mut config = Config::for_project(&self.root);
        config.cache_dir = self.root.join(".clangaroo-cache");
        config.watch_files = false;
        config
    }

    pub fn write_file(&self, path: impl AsRef<Path>, content: impl AsRef<str>) -> Result<()> {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, content.as_ref())?;
        Ok(())
    }

    pub fn cli_bin() -> &'static str {
        env!("CARGO_BIN_EXE_clangaroo")
    }

    pub fn cli(&self) -> CliRunner<'_> {
        CliRunner::new(self)
    }
}
