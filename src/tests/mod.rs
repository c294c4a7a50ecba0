//! Scenario tests that run whole poll cycles against a scripted provider.

mod cycle_tests;
