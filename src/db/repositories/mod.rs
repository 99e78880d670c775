mod samples;

pub(super) use samples::insert_samples;
