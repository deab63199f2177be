fn main() {
    // No-op on host builds; emits ESP-IDF link/cfg directives when the
    // espidf environment is present.
    embuild::espidf::sysenv::output();
}
