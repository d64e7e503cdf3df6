mod deadlines;
mod settings;
