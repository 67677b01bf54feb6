// etvm-sys — host process wiring the console, cvars, filesystem and
// module registry together

pub mod sys_main;
