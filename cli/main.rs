// Copyright 2025 the modcdn authors. MIT license.

pub fn main() {
  // All real work lives in the library crate so the test targets never
  // need the binary built. Keep this shim as thin as it looks.
  modcdn::main()
}
