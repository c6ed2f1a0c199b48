//! Scenario tests driving the whole selection pass against in-memory
//! catalog, tide and export stand-ins.
