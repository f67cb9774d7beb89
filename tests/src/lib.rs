//! Integration tests for the prism client core live in `tests/`.
