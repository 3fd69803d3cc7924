pub(crate) mod sys;
